//! Handoff: одноместный rendezvous между transactional loop и transform stage.
//!
//! Один слот обслуживает оба направления: loop пишет запись, stage забирает
//! её, обрабатывает и пишет ответ обратно, loop читает ответ. Следующая
//! запись входит в слот только после полного round trip предыдущей.
//!
//! Обе стороны ждут с учётом `CancellationToken`, а drop любой из сторон
//! закрывает канал и будит другую: зависшего rendezvous не бывает.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use eos_api::BridgeError;

/// Наблюдаемое состояние слота.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    Empty,
    /// Loop записал значение, stage его ещё не забрал.
    AwaitingConsumer,
    /// Значение у stage: ответ ещё не записан или ещё не прочитан loop'ом.
    AwaitingProducer,
}

enum Slot {
    Empty,
    Request(Vec<u8>),
    Processing,
    Reply(Result<Vec<u8>, BridgeError>),
    /// Loop отменил exchange, пока stage обрабатывал запись.
    /// Поздний ответ stage отбрасывается.
    Abandoned,
}

impl Slot {
    fn state(&self) -> HandoffState {
        match self {
            Slot::Empty => HandoffState::Empty,
            Slot::Request(_) => HandoffState::AwaitingConsumer,
            Slot::Processing | Slot::Reply(_) | Slot::Abandoned => HandoffState::AwaitingProducer,
        }
    }
}

enum Interrupted {
    Cancelled,
    Closed,
}

impl From<Interrupted> for BridgeError {
    fn from(i: Interrupted) -> Self {
        match i {
            Interrupted::Cancelled => BridgeError::cancelled(),
            Interrupted::Closed => BridgeError::io("handoff closed"),
        }
    }
}

struct Shared {
    slot: Mutex<Slot>,
    changed: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ждать, пока `step` не вернёт `Some`. `step` видит слот под lock'ом
    /// и может его изменить; после успешного шага будятся все ожидающие.
    async fn wait_until<T>(
        &self,
        cancel: &CancellationToken,
        mut step: impl FnMut(&mut Slot) -> Option<T>,
    ) -> Result<T, Interrupted> {
        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();

            let stepped = {
                let mut slot = self.lock();
                step(&mut *slot)
            };
            if let Some(v) = stepped {
                self.changed.notify_waiters();
                return Ok(v);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(Interrupted::Closed);
            }

            tokio::select! {
                biased;
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }
}

/// Создать handoff. Время жизни: до drop'а любой из сторон.
pub fn channel() -> (LoopHandle, StageHandle) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Empty),
        changed: Notify::new(),
        closed: AtomicBool::new(false),
    });
    (
        LoopHandle { shared: shared.clone() },
        StageHandle { shared },
    )
}

/// Сторона transactional loop'а: пишет запись, читает результат.
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Полный round trip одной записи: write → stage → write-back → read.
    ///
    /// Ошибки: `Cancelled` при отмене, `Io` если stage закрыл канал,
    /// либо tagged failure, которую вернул сам stage.
    pub async fn exchange(
        &mut self,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, BridgeError> {
        let shared = &*self.shared;

        // Предыдущий exchange мог быть брошен посреди обработки:
        // ждём, пока stage освободит слот.
        let mut payload = Some(payload);
        let written = shared
            .wait_until(cancel, |slot| {
                if !matches!(slot, Slot::Empty) {
                    return None;
                }
                *slot = Slot::Request(payload.take()?);
                Some(())
            })
            .await;
        written?;

        let read = shared
            .wait_until(cancel, |slot| match std::mem::replace(slot, Slot::Empty) {
                Slot::Reply(reply) => Some(reply),
                other => {
                    *slot = other;
                    None
                }
            })
            .await;

        match read {
            Ok(reply) => reply,
            Err(interrupted) => {
                {
                    let mut slot = shared.lock();
                    *slot = match std::mem::replace(&mut *slot, Slot::Empty) {
                        // Stage так и не забрал запись: забираем обратно.
                        Slot::Request(_) | Slot::Reply(_) | Slot::Empty => Slot::Empty,
                        Slot::Processing | Slot::Abandoned => Slot::Abandoned,
                    };
                }
                shared.changed.notify_waiters();
                Err(interrupted.into())
            }
        }
    }

    pub fn state(&self) -> HandoffState {
        self.shared.lock().state()
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Сторона transform stage: забирает запись, пишет результат обратно.
pub struct StageHandle {
    shared: Arc<Shared>,
}

impl StageHandle {
    /// Дождаться записи от loop'а.
    pub async fn recv(&mut self, cancel: &CancellationToken) -> Result<Vec<u8>, BridgeError> {
        self.shared
            .wait_until(cancel, |slot| match std::mem::replace(slot, Slot::Processing) {
                Slot::Request(payload) => Some(payload),
                other => {
                    *slot = other;
                    None
                }
            })
            .await
            .map_err(BridgeError::from)
    }

    /// Записать результат и дождаться, пока loop его прочитает.
    ///
    /// Ответ на брошенный loop'ом exchange молча отбрасывается.
    pub async fn reply(
        &mut self,
        result: Result<Vec<u8>, BridgeError>,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        let shared = &*self.shared;
        let abandoned = {
            let mut slot = shared.lock();
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Processing => {
                    *slot = Slot::Reply(result);
                    false
                }
                Slot::Abandoned => true,
                other => {
                    *slot = other;
                    return Err(BridgeError::session("handoff reply without a pending request"));
                }
            }
        };
        shared.changed.notify_waiters();
        if abandoned {
            tracing::debug!("handoff abandoned by loop, reply dropped");
            return Ok(());
        }

        shared
            .wait_until(cancel, |slot| (!matches!(slot, Slot::Reply(_))).then_some(()))
            .await
            .map_err(BridgeError::from)
    }

    pub fn state(&self) -> HandoffState {
        self.shared.lock().state()
    }
}

impl Drop for StageHandle {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use eos_api::ErrorKind;
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    async fn wait_for_state(handle: &LoopHandle, want: HandoffState) {
        timeout(WAIT, async {
            while handle.state() != want {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("state not reached");
    }

    #[tokio::test]
    async fn round_trip_returns_stage_output() {
        let (mut lp, mut stage) = channel();
        let cancel = CancellationToken::new();
        assert_eq!(lp.state(), HandoffState::Empty);

        let (taken_tx, taken_rx) = tokio::sync::oneshot::channel();
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        let stage_cancel = cancel.clone();
        let stage_task = tokio::spawn(async move {
            let payload = stage.recv(&stage_cancel).await.unwrap();
            taken_tx.send(()).unwrap();
            go_rx.await.unwrap();
            let mut out = payload;
            out.extend_from_slice(b"!");
            stage.reply(Ok(out), &stage_cancel).await.unwrap();
        });

        let exchange = tokio::spawn(async move {
            let res = lp.exchange(b"ping".to_vec(), &cancel).await;
            (lp, res)
        });

        timeout(WAIT, taken_rx).await.unwrap().unwrap();
        go_tx.send(()).unwrap();

        let (lp, res) = timeout(WAIT, exchange).await.unwrap().unwrap();
        assert_eq!(res.unwrap(), b"ping!".to_vec());
        assert_eq!(lp.state(), HandoffState::Empty);
        stage_task.await.unwrap();
    }

    #[tokio::test]
    async fn write_waits_for_consumer() {
        let (mut lp, mut stage) = channel();
        let cancel = CancellationToken::new();

        let writer = tokio::spawn({
            let cancel = cancel.clone();
            async move { lp.exchange(b"x".to_vec(), &cancel).await }
        });

        // Без читателя запись висит в AwaitingConsumer.
        timeout(WAIT, async {
            while stage.state() != HandoffState::AwaitingConsumer {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert!(!writer.is_finished());

        let payload = stage.recv(&cancel).await.unwrap();
        assert_eq!(stage.state(), HandoffState::AwaitingProducer);
        stage.reply(Ok(payload), &cancel).await.unwrap();

        assert_eq!(timeout(WAIT, writer).await.unwrap().unwrap().unwrap(), b"x".to_vec());
    }

    #[tokio::test]
    async fn sequential_exchanges_keep_order() {
        let (mut lp, mut stage) = channel();
        let cancel = CancellationToken::new();

        let stage_cancel = cancel.clone();
        let seen = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(payload) = stage.recv(&stage_cancel).await {
                seen.push(payload.clone());
                if stage.reply(Ok(payload), &stage_cancel).await.is_err() {
                    break;
                }
            }
            seen
        });

        for i in 0..20u8 {
            let out = timeout(WAIT, lp.exchange(vec![i], &cancel)).await.unwrap().unwrap();
            assert_eq!(out, vec![i]);
            assert_eq!(lp.state(), HandoffState::Empty);
        }
        drop(lp);

        let seen = timeout(WAIT, seen).await.unwrap().unwrap();
        assert_eq!(seen, (0..20u8).map(|i| vec![i]).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn tagged_failure_reaches_loop() {
        let (mut lp, mut stage) = channel();
        let cancel = CancellationToken::new();
        let stage_cancel = cancel.clone();
        tokio::spawn(async move {
            stage.recv(&stage_cancel).await.unwrap();
            stage
                .reply(Err(BridgeError::format_err("encode envelope: boom")), &stage_cancel)
                .await
                .unwrap();
        });

        let err = timeout(WAIT, lp.exchange(b"{}".to_vec(), &cancel)).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[tokio::test]
    async fn cancel_without_consumer_takes_value_back() {
        let (mut lp, _stage) = channel();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = timeout(WAIT, lp.exchange(b"stuck".to_vec(), &cancel)).await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(lp.state(), HandoffState::Empty);
    }

    #[tokio::test]
    async fn dropped_stage_unblocks_loop() {
        let (mut lp, stage) = channel();
        let cancel = CancellationToken::new();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(stage);
        });

        let err = timeout(WAIT, lp.exchange(b"x".to_vec(), &cancel)).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(lp.state(), HandoffState::Empty);
    }

    #[tokio::test]
    async fn dropped_loop_unblocks_stage() {
        let (lp, mut stage) = channel();
        let cancel = CancellationToken::new();
        drop(lp);
        let err = timeout(WAIT, stage.recv(&cancel)).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn abandoned_reply_is_discarded() {
        let (mut lp, mut stage) = channel();
        let loop_cancel = CancellationToken::new();
        let stage_cancel = CancellationToken::new();

        let exchange = tokio::spawn({
            let cancel = loop_cancel.clone();
            async move {
                let res = lp.exchange(b"first".to_vec(), &cancel).await;
                (lp, res)
            }
        });

        let first = stage.recv(&stage_cancel).await.unwrap();
        assert_eq!(first, b"first".to_vec());
        loop_cancel.cancel();
        let (mut lp, res) = timeout(WAIT, exchange).await.unwrap().unwrap();
        assert!(res.unwrap_err().is_cancelled());

        // Поздний ответ не должен попасть в следующий exchange.
        stage.reply(Ok(b"late".to_vec()), &stage_cancel).await.unwrap();
        wait_for_state(&lp, HandoffState::Empty).await;

        let fresh = CancellationToken::new();
        let stage_task = tokio::spawn(async move {
            let payload = stage.recv(&stage_cancel).await.unwrap();
            stage.reply(Ok(payload), &stage_cancel).await.unwrap();
        });
        let out = timeout(WAIT, lp.exchange(b"second".to_vec(), &fresh)).await.unwrap().unwrap();
        assert_eq!(out, b"second".to_vec());
        stage_task.await.unwrap();
    }
}

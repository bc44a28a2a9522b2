use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::BridgeError;

/// Состояние трекера: либо чисто, либо первая зафиксированная ошибка.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerState {
    Clear,
    Failed(BridgeError),
}

struct Inner {
    state: Mutex<TrackerState>,
    /// Число выданных, но ещё не завершённых promise.
    pending: watch::Sender<usize>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First error wins.
    fn record(&self, err: BridgeError) {
        let mut state = self.lock();
        if *state == TrackerState::Clear {
            *state = TrackerState::Failed(err);
        }
    }

    fn release(&self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Общий трекер ошибок одной транзакции.
///
/// Async-завершения produce пишут в него конкурентно, loop читает его при
/// закрытии транзакции. Создаётся на каждую итерацию и не переиспользуется.
#[derive(Clone)]
pub struct ErrorTracker {
    inner: Arc<Inner>,
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorTracker {
    pub fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(TrackerState::Clear),
                pending,
            }),
        }
    }

    /// Зарегистрировать один produce. Результат сообщается через promise.
    pub fn promise(&self) -> ProducePromise {
        self.inner.pending.send_modify(|n| *n += 1);
        ProducePromise {
            inner: Some(self.inner.clone()),
        }
    }

    /// Зафиксировать ошибку, не связанную с конкретным produce.
    pub fn fail(&self, err: BridgeError) {
        self.inner.record(err);
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.inner.lock(), TrackerState::Failed(_))
    }

    pub fn state(&self) -> TrackerState {
        self.inner.lock().clone()
    }

    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Дождаться завершения всех выданных promise и вернуть первую ошибку.
    pub async fn wait(&self) -> Result<(), BridgeError> {
        let mut rx = self.inner.pending.subscribe();
        // Sender живёт в `inner`, который мы держим: закрыться не может.
        let _ = rx.wait_for(|n| *n == 0).await;
        match self.state() {
            TrackerState::Clear => Ok(()),
            TrackerState::Failed(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Обещание завершить один produce. Брошенный без `complete` promise
/// считается ошибкой produce.
pub struct ProducePromise {
    inner: Option<Arc<Inner>>,
}

impl ProducePromise {
    pub fn complete(mut self, result: Result<(), BridgeError>) {
        if let Some(inner) = self.inner.take() {
            if let Err(e) = result {
                inner.record(e);
            }
            inner.release();
        }
    }

    /// Уже есть ошибка в транзакции: дальнейшие produce бессмысленны.
    pub fn is_aborting(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| matches!(*inner.lock(), TrackerState::Failed(_)))
    }
}

impl Drop for ProducePromise {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.record(BridgeError::produce("produce promise dropped before completion"));
            inner.release();
        }
    }
}

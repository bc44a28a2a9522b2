use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use eos_api::{BridgeError, ErrorKind, ErrorTracker, Fetches, Record, TransactSession};

use crate::handoff::LoopHandle;
use crate::metrics::Metrics;

/// Настройки loop'а, которые не принадлежат сессии брокера.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Topic, в который produce'ятся преобразованные записи.
    pub topic_out: String,
}

/// Как закончилась обработка батча внутри транзакции.
enum BatchOutcome {
    /// Все записи прошли handoff и отправлены в produce.
    Issued(u64),
    /// Transform вернул ошибку: остаток батча не отправляется.
    Failed(u64),
}

/// Transactional fetch → transform → produce loop.
///
/// Владеет сессией брокера эксклюзивно. Одна транзакция на fetch-батч,
/// одна транзакция в полёте одновременно.
pub struct TransactionalLoop {
    session: Box<dyn TransactSession>,
    handoff: LoopHandle,
    config: LoopConfig,
    metrics: Arc<Metrics>,
    span: Span,
}

impl TransactionalLoop {
    pub fn new(
        session: Box<dyn TransactSession>,
        handoff: LoopHandle,
        config: LoopConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            session,
            handoff,
            config,
            metrics,
            span: tracing::info_span!("eos"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Работает до отмены и возвращает terminal error (`Cancelled` при
    /// штатной остановке). Сессия закрывается на любом пути выхода.
    pub async fn run(mut self, cancel: CancellationToken) -> BridgeError {
        let span = self.span.clone();
        async move {
            tracing::info!(topic_out = %self.config.topic_out, "started");
            let err = self.run_loop(&cancel).await;
            self.session.close().await;
            if err.is_cancelled() {
                tracing::info!("stopping");
            } else {
                tracing::error!(error = %err, "stopping");
            }
            err
        }
        .instrument(span)
        .await
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> BridgeError {
        loop {
            let fetches = self.session.fetch(cancel).await;
            if cancel.is_cancelled() {
                return BridgeError::cancelled();
            }
            self.log_fetch_errors(&fetches);
            if fetches.is_empty() {
                continue;
            }
            self.metrics.records_fetched.increment(fetches.len() as u64);

            if let Err(e) = self.session.begin() {
                // Только если сессия не транзакционная или транзакция уже
                // открыта. В корректной работе не случается.
                tracing::error!(error = %e, "unable to start transaction");
                self.metrics.begin_errors.increment(1);
            }

            let tracker = ErrorTracker::new();
            let outcome = self.process_batch(fetches.records, &tracker, cancel).await;

            let (commit, issued) = match outcome {
                Ok(BatchOutcome::Issued(n)) => match tracker.wait().await {
                    Ok(()) => (true, n),
                    Err(e) => {
                        tracing::warn!(error = %e, "produce failed, aborting transaction");
                        if e.kind() == ErrorKind::Produce {
                            self.metrics.produce_errors.increment(1);
                        }
                        (false, n)
                    }
                },
                Ok(BatchOutcome::Failed(n)) => (false, n),
                Err(stop) => {
                    self.end_transaction(cancel, false, 0).await;
                    return stop;
                }
            };

            self.end_transaction(cancel, commit, issued).await;

            if cancel.is_cancelled() {
                return BridgeError::cancelled();
            }
        }
    }

    /// Handoff каждой записи строго по порядку fetch, затем async produce.
    ///
    /// `Err`: loop должен остановиться (отмена или закрытый handoff).
    async fn process_batch(
        &mut self,
        records: Vec<Record>,
        tracker: &ErrorTracker,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, BridgeError> {
        let mut issued = 0u64;
        for record in records {
            tracing::debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "sending data to rule engine"
            );

            let value = match self.handoff.exchange(record.value, cancel).await {
                Ok(v) => v,
                Err(e) if e.is_cancelled() || e.kind() == ErrorKind::Io => return Err(e),
                Err(e) => {
                    let e = e.with_context(format!(
                        "transform {}/{}@{}",
                        record.topic, record.partition, record.offset
                    ));
                    tracing::error!(error = %e, "transform failed, aborting transaction");
                    tracker.fail(e);
                    return Ok(BatchOutcome::Failed(issued));
                }
            };
            self.metrics.handoffs.increment(1);

            tracing::debug!(offset = record.offset, "receive from rule engine, publish to kafka");
            let out = Record::to(self.config.topic_out.as_str(), value).with_key(record.key);
            self.session.produce(out, tracker.promise());
            issued += 1;
        }
        Ok(BatchOutcome::Issued(issued))
    }

    async fn end_transaction(&mut self, cancel: &CancellationToken, commit: bool, issued: u64) {
        match self.session.end(cancel, commit).await {
            Ok(true) => {
                tracing::info!(records = issued, "commit successful!");
                self.metrics.transactions_committed.increment(1);
                self.metrics.records_produced.increment(issued);
            }
            Ok(false) => {
                tracing::info!(records = issued, "transaction aborted");
                self.metrics.transactions_aborted.increment(1);
            }
            Err(e) => {
                // end уже сделал свои retry: повторять нечего.
                tracing::error!(error = %e, "unable to eos commit");
                self.metrics.end_errors.increment(1);
            }
        }
    }

    fn log_fetch_errors(&self, fetches: &Fetches) {
        for fe in &fetches.errors {
            tracing::warn!(
                topic = %fe.topic,
                partition = fe.partition,
                error = %fe.error,
                "error consuming from topic"
            );
            self.metrics.fetch_errors.increment(1);
        }
    }
}

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use eos_api::{BridgeError, Envelope, Status, Transformer};

use crate::handoff::StageHandle;
use crate::metrics::Metrics;

/// Имя stage по умолчанию в trace envelope.
pub const DEFAULT_STAGE_NAME: &str = "Rule Service";

/// Локальное время в формате `YYYY/MM/DD HH:MM:SS`.
pub fn local_timestamp() -> String {
    chrono::Local::now().format("%Y/%m/%d %H:%M:%S").to_string()
}

// ═══════════════════════════════════════════════════════════════
//  RuleTransformer
// ═══════════════════════════════════════════════════════════════

/// Иллюстративное правило: статус → PENDING, + имя stage в trace, + timestamp.
///
/// Нераспарсенный вход не отбрасывается: обработка продолжается с пустым
/// envelope.
pub struct RuleTransformer {
    name: String,
    clock: Box<dyn Fn() -> String + Send + Sync>,
    metrics: Option<Arc<Metrics>>,
}

impl Default for RuleTransformer {
    fn default() -> Self {
        Self::new(DEFAULT_STAGE_NAME)
    }
}

impl RuleTransformer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clock: Box::new(local_timestamp),
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Применить правило к уже декодированному envelope.
    pub fn apply(&self, mut envelope: Envelope) -> Envelope {
        envelope.transaction_status = Status::Pending;
        envelope.append_trace(self.name.as_str());
        envelope.transaction_timestamp = (self.clock)();
        envelope
    }
}

impl Transformer for RuleTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&self, payload: &[u8]) -> Result<Vec<u8>, BridgeError> {
        let envelope = Envelope::decode(payload).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "bad envelope, continuing with empty one");
            if let Some(m) = &self.metrics {
                m.decode_errors.increment(1);
            }
            Envelope::default()
        });

        self.apply(envelope).encode().inspect_err(|_| {
            if let Some(m) = &self.metrics {
                m.encode_errors.increment(1);
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  TransformStage
// ═══════════════════════════════════════════════════════════════

/// Loop transform stage: recv из handoff → transform → reply в handoff.
///
/// Между записями состояния нет.
pub struct TransformStage {
    handoff: StageHandle,
    transformer: Arc<dyn Transformer>,
    span: Span,
}

impl TransformStage {
    pub fn new(handoff: StageHandle, transformer: Arc<dyn Transformer>) -> Self {
        Self {
            handoff,
            transformer,
            span: tracing::info_span!("rule_engine"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Работает до отмены. Возвращает terminal error: `Cancelled` при штатной
    /// остановке, `Io` если loop закрыл handoff.
    pub async fn run(mut self, cancel: CancellationToken) -> BridgeError {
        let span = self.span.clone();
        async move {
            tracing::info!(stage = %self.transformer.name(), "started");
            let err = loop {
                let payload = match self.handoff.recv(&cancel).await {
                    Ok(p) => p,
                    Err(e) => break e,
                };
                tracing::debug!(bytes = payload.len(), "receive from kafka");

                let result = self.transformer.transform(&payload);
                if let Err(e) = &result {
                    tracing::error!(error = %e, "transform failed, reporting to loop");
                }

                if let Err(e) = self.handoff.reply(result, &cancel).await {
                    break e;
                }
            };

            if err.is_cancelled() {
                tracing::info!("stopped");
            } else {
                tracing::warn!(error = %err, "stopped");
            }
            err
        }
        .instrument(span)
        .await
    }
}

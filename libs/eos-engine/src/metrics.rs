//! Счётчики bridge поверх `metrics` + Prometheus exporter.
//!
//! У каждого `Metrics` свой recorder: counter'ы регистрируются в нём при
//! создании, глобальный recorder процесса не трогается.

use metrics::{Counter, counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Префикс метрик по умолчанию.
pub const DEFAULT_NAMESPACE: &str = "kgo";

/// Счётчики bridge. Разделяются между loop, stage и HTTP endpoint'ом.
pub struct Metrics {
    pub records_fetched: Counter,
    pub fetch_errors: Counter,
    pub records_produced: Counter,
    pub produce_errors: Counter,
    pub transactions_committed: Counter,
    pub transactions_aborted: Counter,
    pub begin_errors: Counter,
    pub end_errors: Counter,
    pub handoffs: Counter,
    pub decode_errors: Counter,
    pub encode_errors: Counter,
    namespace: String,
    handle: PrometheusHandle,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").field("namespace", &self.namespace).finish()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::with_namespace(DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(namespace: &str) -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let register = |name: &str, help: &'static str| {
                let full = format!("{namespace}_{name}_total");
                describe_counter!(full.clone(), help);
                counter!(full)
            };
            Self {
                records_fetched: register("records_fetched", "Records fetched from the input topic."),
                fetch_errors: register("fetch_errors", "Per-partition fetch errors."),
                records_produced: register("records_produced", "Records produced in committed transactions."),
                produce_errors: register("produce_errors", "Transactions aborted by a produce error."),
                transactions_committed: register("transactions_committed", "Committed transactions."),
                transactions_aborted: register("transactions_aborted", "Aborted transactions."),
                begin_errors: register("begin_errors", "Failed transaction begins."),
                end_errors: register("end_errors", "Failed transaction commits or aborts."),
                handoffs: register("handoffs", "Completed handoff round trips."),
                decode_errors: register("decode_errors", "Envelopes that failed to decode."),
                encode_errors: register("encode_errors", "Envelopes that failed to encode."),
                namespace: namespace.to_string(),
                handle: handle.clone(),
            }
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Handle exporter'а для HTTP endpoint'а.
    pub fn handle(&self) -> PrometheusHandle {
        self.handle.clone()
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Текущее значение counter'а `name` (без префикса и `_total`), как его
    /// видит exporter. 0, если counter не найден.
    pub fn value(&self, name: &str) -> u64 {
        let metric = format!("{}_{name}_total", self.namespace);
        self.render()
            .lines()
            .filter_map(|line| line.strip_prefix(metric.as_str()))
            .filter_map(|rest| rest.strip_prefix(' '))
            .find_map(|v| v.trim().parse::<f64>().ok())
            .map_or(0, |v| v as u64)
    }
}

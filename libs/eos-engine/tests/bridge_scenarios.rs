//! End-to-end scenarios: transactional loop + transform stage over the
//! in-memory broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use eos_api::{BridgeError, Envelope, ErrorKind, Record, Status, Transformer};
use eos_engine::{
    BridgeTasks, LoopConfig, MemoryBroker, Metrics, RuleTransformer, SessionConfig, spawn_bridge,
    spawn_bridge_in,
};

const IN: &str = "GoRuleEngineServiceIn";
const OUT: &str = "GoRuleEngineServiceOutTransformationServiceIn";
const GROUP: &str = "eos-task-force-group";
const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    broker: MemoryBroker,
    metrics: Arc<Metrics>,
    token: CancellationToken,
    tasks: BridgeTasks,
}

fn broker() -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.create_topic(IN, 1).unwrap();
    broker.create_topic(OUT, 1).unwrap();
    broker
}

fn rule() -> Arc<dyn Transformer> {
    Arc::new(RuleTransformer::default().with_clock(|| "2026/10/17 09:30:00".to_string()))
}

fn start(broker: MemoryBroker, transformer: Arc<dyn Transformer>) -> Harness {
    let metrics = Arc::new(Metrics::new());
    let token = CancellationToken::new();
    let session = broker.session(SessionConfig::transactional(GROUP, IN, "eos-test-txn"));
    let tasks = spawn_bridge_in(
        &tracing::info_span!("scenario"),
        Box::new(session),
        transformer,
        LoopConfig { topic_out: OUT.to_string() },
        metrics.clone(),
        token.clone(),
    );
    Harness { broker, metrics, token, tasks }
}

impl Harness {
    async fn wait_for_output(&self, n: usize) -> Vec<Record> {
        timeout(WAIT, async {
            loop {
                let out = self.broker.records(OUT);
                if out.len() >= n {
                    return out;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("output not produced in time")
    }

    async fn shutdown(self) -> (BridgeError, BridgeError) {
        self.token.cancel();
        timeout(WAIT, self.tasks.join()).await.expect("tasks did not stop")
    }
}

fn envelope(id: &str) -> Vec<u8> {
    format!(
        r#"{{"transactionId":"{id}","transactionStatus":"NEW","transactionTracking":[],"transactionTimestamp":""}}"#
    )
    .into_bytes()
}

fn decode_all(records: &[Record]) -> Vec<Envelope> {
    records.iter().map(|r| Envelope::decode(&r.value).unwrap()).collect()
}

#[tokio::test]
async fn batch_of_three_is_transformed_and_committed() {
    let b = broker();
    for id in ["t1", "t2", "t3"] {
        b.append(IN, 0, None, envelope(id)).unwrap();
    }
    let h = start(b, rule());

    let out = decode_all(&h.wait_for_output(3).await);
    assert_eq!(
        out.iter().map(|e| e.transaction_id.as_str()).collect::<Vec<_>>(),
        ["t1", "t2", "t3"]
    );
    for env in &out {
        assert_eq!(env.transaction_status, Status::Pending);
        assert_eq!(env.transaction_tracking, vec!["Rule Service".to_string()]);
        assert!(!env.transaction_timestamp.is_empty());
    }
    assert_eq!(h.broker.committed_offset(GROUP, IN, 0), Some(3));

    let metrics = h.metrics.clone();
    let (transact, transform) = h.shutdown().await;
    assert!(transact.is_cancelled());
    assert!(transform.is_cancelled());
    assert_eq!(metrics.value("records_fetched"), 3);
    assert_eq!(metrics.value("records_produced"), 3);
    assert_eq!(metrics.value("handoffs"), 3);
    assert_eq!(metrics.value("transactions_committed"), 1);
}

#[tokio::test]
async fn failed_produce_aborts_whole_batch_and_redelivers() {
    let b = broker();
    for id in ["a", "b", "c"] {
        b.append(IN, 0, None, envelope(id)).unwrap();
    }
    b.fail_produce_at(2);
    let h = start(b, rule());

    let out = decode_all(&h.wait_for_output(3).await);
    // Никаких частичных commit'ов: ровно один экземпляр каждой записи.
    assert_eq!(
        out.iter().map(|e| e.transaction_id.as_str()).collect::<Vec<_>>(),
        ["a", "b", "c"]
    );
    assert_eq!(h.broker.committed_offset(GROUP, IN, 0), Some(3));

    let metrics = h.metrics.clone();
    h.shutdown().await;
    assert_eq!(metrics.value("transactions_aborted"), 1);
    assert_eq!(metrics.value("transactions_committed"), 1);
    assert_eq!(metrics.value("produce_errors"), 1);
    // Батч прочитан дважды.
    assert_eq!(metrics.value("records_fetched"), 6);
    assert_eq!(metrics.value("records_produced"), 3);
}

#[tokio::test]
async fn malformed_input_degrades_and_processing_continues() {
    let b = broker();
    b.append(IN, 0, None, b"{definitely not json".to_vec()).unwrap();
    b.append(IN, 0, None, envelope("after")).unwrap();
    let h = start(b, rule());

    let out = decode_all(&h.wait_for_output(2).await);
    assert!(out[0].transaction_id.is_empty());
    assert_eq!(out[0].transaction_tracking, vec!["Rule Service".to_string()]);
    assert_eq!(out[0].transaction_status, Status::Pending);
    assert!(!out[0].transaction_timestamp.is_empty());
    assert_eq!(out[1].transaction_id, "after");

    let metrics = h.metrics.clone();
    h.shutdown().await;
    assert_eq!(metrics.value("transactions_committed"), 1);
}

#[tokio::test]
async fn cancel_while_fetching_skips_begin_and_end() {
    let h = start(broker(), rule());
    tokio::time::sleep(Duration::from_millis(30)).await;

    let metrics = h.metrics.clone();
    let (transact, transform) = h.shutdown().await;
    assert!(transact.is_cancelled());
    assert!(transform.is_cancelled());
    assert_eq!(metrics.value("begin_errors"), 0);
    assert_eq!(metrics.value("transactions_committed"), 0);
    assert_eq!(metrics.value("transactions_aborted"), 0);
    assert_eq!(metrics.value("end_errors"), 0);
}

/// Первый вызов сигналит `entered` и держит stage занятым.
struct SlowFirst {
    entered: Arc<Notify>,
    started: AtomicBool,
    inner: Arc<dyn Transformer>,
}

impl Transformer for SlowFirst {
    fn name(&self) -> &str {
        "slow"
    }

    fn transform(&self, payload: &[u8]) -> Result<Vec<u8>, BridgeError> {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            std::thread::sleep(Duration::from_millis(200));
        }
        self.inner.transform(payload)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_handoff_aborts_and_batch_is_redelivered() {
    let b = broker();
    for id in ["a", "b", "c"] {
        b.append(IN, 0, None, envelope(id)).unwrap();
    }
    let entered = Arc::new(Notify::new());
    let slow = Arc::new(SlowFirst { entered: entered.clone(), started: AtomicBool::new(false), inner: rule() });
    let h = start(b.clone(), slow);

    timeout(WAIT, entered.notified()).await.expect("stage never received a record");
    let metrics = h.metrics.clone();
    let (transact, _) = h.shutdown().await;
    assert!(transact.is_cancelled());
    assert!(b.records(OUT).is_empty());
    assert_eq!(b.committed_offset(GROUP, IN, 0), None);
    assert_eq!(metrics.value("transactions_aborted"), 1);
    assert_eq!(metrics.value("transactions_committed"), 0);

    // Новая сессия той же группы получает весь батч заново.
    let again = start(b, rule());
    let out = decode_all(&again.wait_for_output(3).await);
    assert_eq!(
        out.iter().map(|e| e.transaction_id.as_str()).collect::<Vec<_>>(),
        ["a", "b", "c"]
    );
    assert_eq!(again.broker.committed_offset(GROUP, IN, 0), Some(3));
    again.shutdown().await;
}

struct Panicky;

impl Transformer for Panicky {
    fn name(&self) -> &str {
        "panicky"
    }

    fn transform(&self, _payload: &[u8]) -> Result<Vec<u8>, BridgeError> {
        panic!("rule bug")
    }
}

#[tokio::test]
async fn dead_stage_is_reported_without_cancellation() {
    let b = broker();
    b.append(IN, 0, None, envelope("boom")).unwrap();
    let mut h = start(b, Arc::new(Panicky));

    let (task, err) = timeout(WAIT, h.tasks.first_exit()).await.expect("bridge kept running");
    assert!(!err.is_cancelled(), "{task} exited with {err:?}");
    assert!(!h.token.is_cancelled());
    assert!(h.broker.records(OUT).is_empty());
    assert_eq!(h.broker.committed_offset(GROUP, IN, 0), None);

    // Повторный вызов отдаёт ту же задачу, join остаётся рабочим.
    let (same, _) = h.tasks.first_exit().await;
    assert_eq!(same, task);
    let (_, transform) = h.shutdown().await;
    assert_eq!(transform.kind(), ErrorKind::Io);
}

#[tokio::test]
async fn order_is_preserved_across_large_batch() {
    let b = broker();
    let ids: Vec<String> = (0..200).map(|i| format!("id-{i:03}")).collect();
    for id in &ids {
        b.append(IN, 0, None, envelope(id)).unwrap();
    }
    let h = start(b, rule());

    let out = decode_all(&h.wait_for_output(ids.len()).await);
    assert_eq!(out.iter().map(|e| e.transaction_id.clone()).collect::<Vec<_>>(), ids);
    h.shutdown().await;
}

#[tokio::test]
async fn records_arriving_later_are_picked_up() {
    let h = start(broker(), rule());
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.broker.append(IN, 0, Some(b"k1".to_vec()), envelope("late")).unwrap();

    let out = h.wait_for_output(1).await;
    assert_eq!(out[0].key.as_deref(), Some(&b"k1"[..]));
    assert_eq!(Envelope::decode(&out[0].value).unwrap().transaction_id, "late");
    h.shutdown().await;
}

#[tokio::test]
async fn partition_fetch_errors_do_not_block_records() {
    let b = broker();
    b.inject_fetch_error(IN, 7, "NOT_LEADER_FOR_PARTITION");
    b.append(IN, 0, None, envelope("ok")).unwrap();
    let h = start(b, rule());

    let out = decode_all(&h.wait_for_output(1).await);
    assert_eq!(out[0].transaction_id, "ok");

    let metrics = h.metrics.clone();
    h.shutdown().await;
    assert_eq!(metrics.value("fetch_errors"), 1);
}

/// Проваливает первый transform, дальше работает как обычное правило.
struct FlakyOnce {
    calls: AtomicUsize,
    inner: Arc<dyn Transformer>,
}

impl Transformer for FlakyOnce {
    fn name(&self) -> &str {
        "flaky"
    }

    fn transform(&self, payload: &[u8]) -> Result<Vec<u8>, BridgeError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(BridgeError::format_err("encode envelope: simulated"));
        }
        self.inner.transform(payload)
    }
}

#[tokio::test]
async fn transform_failure_aborts_transaction() {
    let b = broker();
    for id in ["x", "y"] {
        b.append(IN, 0, None, envelope(id)).unwrap();
    }
    let flaky = Arc::new(FlakyOnce { calls: AtomicUsize::new(0), inner: rule() });
    let h = start(b, flaky);

    let out = decode_all(&h.wait_for_output(2).await);
    assert_eq!(
        out.iter().map(|e| e.transaction_id.as_str()).collect::<Vec<_>>(),
        ["x", "y"]
    );

    let metrics = h.metrics.clone();
    h.shutdown().await;
    assert_eq!(metrics.value("transactions_aborted"), 1);
    assert_eq!(metrics.value("transactions_committed"), 1);
}

#[tokio::test]
async fn non_transactional_session_never_commits() {
    let b = broker();
    b.append(IN, 0, None, envelope("n")).unwrap();

    let metrics = Arc::new(Metrics::new());
    let token = CancellationToken::new();
    let session = b.session(SessionConfig {
        transactional_id: None,
        ..SessionConfig::transactional(GROUP, IN, "unused")
    });
    let tasks = spawn_bridge(
        Box::new(session),
        rule(),
        LoopConfig { topic_out: OUT.to_string() },
        metrics.clone(),
        token.clone(),
    );

    timeout(WAIT, async {
        while metrics.value("end_errors") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    token.cancel();
    let (transact, _) = timeout(WAIT, tasks.join()).await.unwrap();
    assert_eq!(transact.kind(), ErrorKind::Cancelled);
    assert!(metrics.value("begin_errors") >= 1);
    assert_eq!(metrics.value("transactions_committed"), 0);
    assert!(b.records(OUT).is_empty());
}

//! In-process брокер с транзакционной сессией.
//!
//! Read-committed: записи, отправленные в транзакции, видны только после
//! commit. Abort отбрасывает их и откатывает позицию consumer'а к последнему
//! закоммиченному offset'у, так что батч приходит повторно.

use std::collections::HashMap;
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::pin::{Pin, pin};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use eos_api::{BridgeError, FetchError, Fetches, ProducePromise, Record, TransactSession};

// ═══════════════════════════════════════════════════════════════
//  Broker
// ═══════════════════════════════════════════════════════════════

struct StoredRecord {
    key: Option<Vec<u8>>,
    value: Vec<u8>,
    ts_ms: i64,
}

#[derive(Default)]
struct State {
    /// topic → partitions → committed log.
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// (group, topic, partition) → следующий offset для чтения.
    committed: HashMap<(String, String, i32), i64>,
    fail_produce_at: Option<usize>,
    fetch_errors: Vec<FetchError>,
}

/// Разделяемый handle in-memory брокера. Clone: тот же брокер.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Создать topic. Повторное создание с тем же числом партиций: no-op.
    pub fn create_topic(&self, name: &str, partitions: usize) -> Result<(), BridgeError> {
        if partitions == 0 {
            return Err(BridgeError::config(format!("topic '{name}': partitions must be > 0")));
        }
        let mut state = self.lock();
        match state.topics.get(name) {
            Some(existing) if existing.len() != partitions => Err(BridgeError::config(format!(
                "topic '{name}' already exists with {} partitions",
                existing.len()
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .topics
                    .insert(name.to_string(), (0..partitions).map(|_| Vec::new()).collect());
                Ok(())
            }
        }
    }

    /// Нетранзакционная запись. Возвращает offset.
    pub fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> Result<i64, BridgeError> {
        let offset = {
            let mut state = self.lock();
            let log = state
                .topics
                .get_mut(topic)
                .and_then(|parts| usize::try_from(partition).ok().and_then(|p| parts.get_mut(p)))
                .ok_or_else(|| BridgeError::io(format!("unknown topic or partition {topic}/{partition}")))?;
            log.push(StoredRecord { key, value, ts_ms: eos_api::now_ms() });
            log.len() as i64 - 1
        };
        self.appended.notify_waiters();
        Ok(offset)
    }

    /// Закоммиченные записи topic'а: по партициям, внутри: по offset'у.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        let state = self.lock();
        let Some(parts) = state.topics.get(topic) else {
            return Vec::new();
        };
        parts
            .iter()
            .enumerate()
            .flat_map(|(p, log)| {
                log.iter().enumerate().map(move |(o, r)| to_record(topic, p as i32, o as i64, r))
            })
            .collect()
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Провалить n-й (с 1) produce следующей транзакции.
    pub fn fail_produce_at(&self, n: usize) {
        self.lock().fail_produce_at = Some(n);
    }

    /// Вернуть per-partition ошибку со следующим fetch'ем.
    pub fn inject_fetch_error(&self, topic: &str, partition: i32, msg: &str) {
        self.lock().fetch_errors.push(FetchError {
            topic: topic.to_string(),
            partition,
            error: BridgeError::io(msg),
        });
        self.appended.notify_waiters();
    }

    pub fn session(&self, config: SessionConfig) -> MemorySession {
        MemorySession {
            broker: self.clone(),
            config,
            positions: HashMap::new(),
            txn: None,
            closed: false,
        }
    }
}

fn to_record(topic: &str, partition: i32, offset: i64, r: &StoredRecord) -> Record {
    Record {
        topic: topic.to_string(),
        partition,
        offset,
        key: r.key.clone(),
        value: r.value.clone(),
        ts_ms: r.ts_ms,
    }
}

fn partition_for(key: Option<&[u8]>, partitions: usize) -> i32 {
    match key {
        Some(k) => {
            let mut h = DefaultHasher::new();
            k.hash(&mut h);
            (h.finish() % partitions as u64) as i32
        }
        None => 0,
    }
}

// ═══════════════════════════════════════════════════════════════
//  Session
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub group: String,
    pub topics_in: Vec<String>,
    /// `None`: нетранзакционная сессия, `begin` вернёт ошибку.
    pub transactional_id: Option<String>,
    pub max_poll_records: usize,
}

impl SessionConfig {
    pub fn transactional(group: &str, topic_in: &str, transactional_id: &str) -> Self {
        Self {
            group: group.to_string(),
            topics_in: vec![topic_in.to_string()],
            transactional_id: Some(transactional_id.to_string()),
            max_poll_records: 500,
        }
    }
}

struct OpenTxn {
    produced: Vec<Record>,
    produce_count: usize,
    fail_at: Option<usize>,
}

/// Consumer group + transactional producer поверх `MemoryBroker`.
pub struct MemorySession {
    broker: MemoryBroker,
    config: SessionConfig,
    /// (topic, partition) → следующий offset для fetch.
    positions: HashMap<(String, i32), i64>,
    txn: Option<OpenTxn>,
    closed: bool,
}

impl MemorySession {
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn poll(&mut self) -> Fetches {
        let broker = self.broker.clone();
        let mut state = broker.lock();
        let mut fetches = Fetches::default();

        let topics_in = &self.config.topics_in;
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.fetch_errors)
            .into_iter()
            .partition(|fe| topics_in.contains(&fe.topic));
        state.fetch_errors = rest;
        fetches.errors = mine;

        let max = self.config.max_poll_records.max(1);
        for topic in &self.config.topics_in {
            let Some(parts) = state.topics.get(topic) else {
                continue;
            };
            for (p, log) in parts.iter().enumerate() {
                let p = p as i32;
                let key = (topic.clone(), p);
                let mut pos = match self.positions.get(&key) {
                    Some(pos) => *pos,
                    None => state
                        .committed
                        .get(&(self.config.group.clone(), topic.clone(), p))
                        .copied()
                        .unwrap_or(0),
                };
                while fetches.records.len() < max {
                    let Some(r) = log.get(pos as usize) else { break };
                    fetches.records.push(to_record(topic, p, pos, r));
                    pos += 1;
                }
                self.positions.insert(key, pos);
            }
        }
        fetches
    }

    fn rewind(&mut self) {
        self.positions.clear();
    }
}

impl TransactSession for MemorySession {
    fn fetch(&mut self, cancel: &CancellationToken) -> Pin<Box<dyn Future<Output = Fetches> + Send + '_>> {
        let cancel = cancel.clone();
        Box::pin(async move {
            if self.closed {
                cancel.cancelled().await;
                return Fetches::default();
            }
            loop {
                let appended = self.broker.appended.clone();
                let mut notified = pin!(appended.notified());
                notified.as_mut().enable();

                let fetches = self.poll();
                if !fetches.is_empty() || !fetches.errors.is_empty() {
                    return fetches;
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Fetches::default(),
                    _ = &mut notified => {}
                }
            }
        })
    }

    fn begin(&mut self) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::session("session closed"));
        }
        if self.config.transactional_id.is_none() {
            return Err(BridgeError::session("not a transactional session"));
        }
        if self.txn.is_some() {
            return Err(BridgeError::session("already in a transaction"));
        }
        let fail_at = self.broker.lock().fail_produce_at.take();
        self.txn = Some(OpenTxn {
            produced: Vec::new(),
            produce_count: 0,
            fail_at,
        });
        Ok(())
    }

    fn produce(&mut self, mut record: Record, promise: ProducePromise) {
        let Some(txn) = self.txn.as_mut() else {
            promise.complete(Err(BridgeError::session("produce outside of a transaction")));
            return;
        };
        txn.produce_count += 1;

        if promise.is_aborting() {
            promise.complete(Err(BridgeError::produce("aborting: earlier produce in transaction failed")));
            return;
        }
        if txn.fail_at == Some(txn.produce_count) {
            promise.complete(Err(BridgeError::produce(format!(
                "injected failure on produce #{}",
                txn.produce_count
            ))));
            return;
        }

        let partitions = self.broker.lock().topics.get(&record.topic).map(Vec::len);
        match partitions {
            Some(n) => {
                if usize::try_from(record.partition).map_or(true, |p| p >= n) {
                    record.partition = partition_for(record.key.as_deref(), n);
                }
                txn.produced.push(record);
                promise.complete(Ok(()));
            }
            None => {
                promise.complete(Err(BridgeError::produce(format!("unknown topic '{}'", record.topic))));
            }
        }
    }

    fn end(
        &mut self,
        _cancel: &CancellationToken,
        commit: bool,
    ) -> Pin<Box<dyn Future<Output = Result<bool, BridgeError>> + Send + '_>> {
        Box::pin(async move {
            let Some(txn) = self.txn.take() else {
                self.rewind();
                return Err(BridgeError::session("not in a transaction"));
            };
            if !commit {
                self.rewind();
                return Ok(false);
            }

            {
                let mut state = self.broker.lock();
                for rec in txn.produced {
                    if let Some(log) = state
                        .topics
                        .get_mut(&rec.topic)
                        .and_then(|parts| parts.get_mut(rec.partition as usize))
                    {
                        log.push(StoredRecord { key: rec.key, value: rec.value, ts_ms: rec.ts_ms });
                    }
                }
                for ((topic, p), pos) in &self.positions {
                    state
                        .committed
                        .insert((self.config.group.clone(), topic.clone(), *p), *pos);
                }
            }
            self.broker.appended.notify_waiters();
            Ok(true)
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if self.txn.take().is_some() {
                tracing::warn!("closing session with open transaction, aborting");
            }
            self.rewind();
            self.closed = true;
        })
    }
}

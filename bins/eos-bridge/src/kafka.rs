//! `TransactSession` поверх librdkafka.
//!
//! Consumer читает в `read_committed` без auto-commit; offset'ы батча
//! коммитятся внутри транзакции producer'а через
//! `send_offsets_to_transaction`. При abort consumer откатывается seek'ом
//! к первому offset'у батча в каждой партиции.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use eos_api::{BridgeError, FetchError, Fetches, ProducePromise, Record, TransactSession};

use crate::config::Effective;

/// Сколько ждать следующей записи, добирая батч после первой.
const LINGER: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub topic_in: String,
    pub group: String,
    pub transactional_id: String,
    pub max_poll_records: usize,
    /// Таймаут операций координатора транзакций.
    pub timeout: Duration,
}

impl KafkaSettings {
    pub fn from_effective(eff: &Effective) -> Self {
        Self {
            brokers: eff.brokers.clone(),
            topic_in: eff.topic_in.clone(),
            group: eff.group.clone(),
            transactional_id: eff.transactional_id.clone(),
            max_poll_records: eff.max_poll_records,
            timeout: Duration::from_secs(30),
        }
    }
}

fn session_err(context: &str) -> impl FnOnce(KafkaError) -> BridgeError + '_ {
    move |e| BridgeError::session(format!("{context}: {e}"))
}

pub struct KafkaSession {
    consumer: StreamConsumer,
    producer: FutureProducer,
    settings: KafkaSettings,
    in_txn: bool,
    /// (topic, partition) → первый offset батча, для seek при abort.
    batch_start: HashMap<(String, i32), i64>,
    /// (topic, partition) → следующий offset, коммитится вместе с транзакцией.
    batch_next: HashMap<(String, i32), i64>,
    deliveries: Vec<JoinHandle<()>>,
}

impl KafkaSession {
    pub async fn connect(settings: KafkaSettings) -> Result<Self, BridgeError> {
        let bootstrap = settings.brokers.join(",");

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap)
            .set("group.id", &settings.group)
            .set("enable.auto.commit", "false")
            .set("isolation.level", "read_committed")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(session_err("create consumer"))?;
        consumer
            .subscribe(&[settings.topic_in.as_str()])
            .map_err(session_err("subscribe"))?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap)
            .set("transactional.id", &settings.transactional_id)
            .set("enable.idempotence", "true")
            .create()
            .map_err(session_err("create producer"))?;

        let init = producer.clone();
        let timeout = settings.timeout;
        tokio::task::spawn_blocking(move || init.init_transactions(timeout))
            .await
            .map_err(|e| BridgeError::session(format!("init transactions: {e}")))?
            .map_err(session_err("init transactions"))?;

        tracing::info!(
            brokers = %bootstrap,
            topic = %settings.topic_in,
            group = %settings.group,
            transactional_id = %settings.transactional_id,
            "kafka session ready"
        );

        Ok(Self {
            consumer,
            producer,
            settings,
            in_txn: false,
            batch_start: HashMap::new(),
            batch_next: HashMap::new(),
            deliveries: Vec::new(),
        })
    }

    fn track(&mut self, record: &Record) {
        let key = (record.topic.clone(), record.partition);
        self.batch_start.entry(key.clone()).or_insert(record.offset);
        self.batch_next.insert(key, record.offset + 1);
    }

    fn push(&mut self, fetches: &mut Fetches, received: Result<Record, KafkaError>) {
        match received {
            Ok(record) => {
                self.track(&record);
                fetches.records.push(record);
            }
            Err(e) => fetches.errors.push(FetchError {
                topic: self.settings.topic_in.clone(),
                partition: -1,
                error: BridgeError::io(e.to_string()),
            }),
        }
    }

    /// Вернуть consumer к началу незакоммиченного батча.
    fn rewind(&mut self) {
        for ((topic, partition), offset) in self.batch_start.drain() {
            if let Err(e) = self
                .consumer
                .seek(&topic, partition, Offset::Offset(offset), self.settings.timeout)
            {
                tracing::warn!(%topic, partition, offset, error = %e, "seek after abort failed");
            }
        }
        self.batch_next.clear();
    }

    async fn abort(&mut self) -> Result<(), BridgeError> {
        let producer = self.producer.clone();
        let timeout = self.settings.timeout;
        let res = tokio::task::spawn_blocking(move || producer.abort_transaction(timeout))
            .await
            .map_err(|e| BridgeError::session(format!("abort transaction: {e}")))?
            .map_err(session_err("abort transaction"));
        self.rewind();
        res
    }

    async fn commit(&mut self) -> Result<(), BridgeError> {
        let mut offsets = TopicPartitionList::new();
        for ((topic, partition), next) in &self.batch_next {
            offsets
                .add_partition_offset(topic, *partition, Offset::Offset(*next))
                .map_err(session_err("offsets"))?;
        }
        let group = self
            .consumer
            .group_metadata()
            .ok_or_else(|| BridgeError::session("consumer has no group metadata"))?;

        let producer = self.producer.clone();
        let timeout = self.settings.timeout;
        tokio::task::spawn_blocking(move || {
            producer.send_offsets_to_transaction(&offsets, &group, timeout)?;
            producer.commit_transaction(timeout)
        })
        .await
        .map_err(|e| BridgeError::session(format!("commit transaction: {e}")))?
        .map_err(session_err("commit transaction"))?;

        self.batch_start.clear();
        self.batch_next.clear();
        Ok(())
    }
}

fn to_record(m: &BorrowedMessage<'_>) -> Record {
    Record {
        topic: m.topic().to_string(),
        partition: m.partition(),
        offset: m.offset(),
        key: m.key().map(<[u8]>::to_vec),
        value: m.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        ts_ms: m.timestamp().to_millis().unwrap_or_else(eos_api::now_ms),
    }
}

impl TransactSession for KafkaSession {
    fn fetch(&mut self, cancel: &CancellationToken) -> Pin<Box<dyn Future<Output = Fetches> + Send + '_>> {
        let cancel = cancel.clone();
        Box::pin(async move {
            let mut fetches = Fetches::default();

            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => return fetches,
                m = self.consumer.recv() => m.map(|m| to_record(&m)),
            };
            self.push(&mut fetches, first);

            // Добрать то, что уже пришло, не дольше LINGER на запись.
            while fetches.records.len() < self.settings.max_poll_records && !cancel.is_cancelled() {
                let next = match tokio::time::timeout(LINGER, self.consumer.recv()).await {
                    Ok(m) => m.map(|m| to_record(&m)),
                    Err(_) => break,
                };
                self.push(&mut fetches, next);
            }
            fetches
        })
    }

    fn begin(&mut self) -> Result<(), BridgeError> {
        if self.in_txn {
            return Err(BridgeError::session("transaction already open"));
        }
        self.producer
            .begin_transaction()
            .map_err(session_err("begin transaction"))?;
        self.in_txn = true;
        Ok(())
    }

    fn produce(&mut self, record: Record, promise: ProducePromise) {
        if promise.is_aborting() {
            promise.complete(Err(BridgeError::produce("transaction is aborting")));
            return;
        }
        let producer = self.producer.clone();
        let timeout = self.settings.timeout;
        self.deliveries.push(tokio::spawn(async move {
            let delivered = match &record.key {
                Some(key) => {
                    let fr = FutureRecord::to(&record.topic).payload(&record.value).key(key);
                    producer.send(fr, timeout).await
                }
                None => {
                    let fr = FutureRecord::<(), Vec<u8>>::to(&record.topic).payload(&record.value);
                    producer.send(fr, timeout).await
                }
            };
            promise.complete(
                delivered
                    .map(|_| ())
                    .map_err(|(e, _)| BridgeError::produce(format!("{}: {e}", record.topic))),
            );
        }));
    }

    fn end(
        &mut self,
        _cancel: &CancellationToken,
        commit: bool,
    ) -> Pin<Box<dyn Future<Output = Result<bool, BridgeError>> + Send + '_>> {
        Box::pin(async move {
            for delivery in self.deliveries.drain(..) {
                let _ = delivery.await;
            }
            if !self.in_txn {
                self.rewind();
                return Err(BridgeError::session("no open transaction"));
            }
            self.in_txn = false;

            if commit {
                match self.commit().await {
                    Ok(()) => return Ok(true),
                    Err(e) => {
                        tracing::warn!(error = %e, "commit failed, aborting");
                        if let Err(abort) = self.abort().await {
                            tracing::error!(error = %abort, "abort after failed commit");
                        }
                        return Err(e);
                    }
                }
            }
            self.abort().await?;
            Ok(false)
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            for delivery in self.deliveries.drain(..) {
                delivery.abort();
            }
            if self.in_txn {
                self.in_txn = false;
                if let Err(e) = self.abort().await {
                    tracing::warn!(error = %e, "abort on close");
                }
            }
            self.consumer.unsubscribe();
            tracing::info!("kafka session closed");
        })
    }
}

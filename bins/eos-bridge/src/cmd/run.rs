use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use eos_api::{BridgeError, TransactSession, Transformer};
use eos_engine::{
    BridgeTask, BridgeTasks, LoopConfig, MemoryBroker, Metrics, RuleTransformer, SessionConfig,
    spawn_bridge_in,
};

use crate::config::{BrokerKind, Effective, RunArgs};
use crate::error::BridgeAppError;

pub async fn run(args: RunArgs) -> Result<(), BridgeAppError> {
    let eff = Effective::new(&args)?;
    tracing::info!(
        config = %args.config,
        brokers = ?eff.brokers,
        topic_in = %eff.topic_in,
        topic_out = %eff.topic_out,
        group = %eff.group,
        broker_kind = ?eff.broker_kind,
        "eos-bridge starting"
    );

    let token = CancellationToken::new();
    let metrics = Arc::new(Metrics::with_namespace(&eff.metrics_namespace));

    // --- Broker session ---
    let (session, memory) = open_session(&eff).await?;

    // --- Loop + stage ---
    let transformer: Arc<dyn Transformer> =
        Arc::new(RuleTransformer::new(eff.stage_name.as_str()).with_metrics(metrics.clone()));
    let tasks = spawn_bridge_in(
        &tracing::info_span!("bridge", topic_in = %eff.topic_in, group = %eff.group),
        session,
        transformer,
        LoopConfig { topic_out: eff.topic_out.clone() },
        metrics.clone(),
        token.clone(),
    );

    // --- Metrics endpoint ---
    let metrics_task = tokio::spawn({
        let addr = eff.debug_host.clone();
        let handle = metrics.handle();
        let token = token.clone();
        async move {
            if let Err(e) = eos_metrics_server::run(&addr, handle, token).await {
                tracing::error!(error = %e, "metrics endpoint error");
            }
        }
    });

    tracing::info!("bridge ready");

    // --- SIGINT / SIGTERM или неожиданный выход задачи ---
    let result = supervise(tasks, &token, eff.shutdown_timeout, wait_for_signal()).await;

    if tokio::time::timeout(eff.shutdown_timeout, metrics_task).await.is_err() {
        tracing::warn!("metrics endpoint did not stop in time");
    }

    if let Some(broker) = memory {
        dump_output(&broker, &eff.topic_out);
    }

    tracing::info!(
        committed = metrics.value("transactions_committed"),
        aborted = metrics.value("transactions_aborted"),
        produced = metrics.value("records_produced"),
        "shutdown complete"
    );
    result
}

enum Stop {
    Signal(&'static str),
    Exited(BridgeTask, BridgeError),
}

/// Ждать сигнала или выхода любой задачи bridge, затем отменить `token`
/// и дождаться обеих задач не дольше `shutdown_timeout`.
///
/// Задача, вышедшая раньше сигнала, даёт `TaskExited`.
async fn supervise(
    mut tasks: BridgeTasks,
    token: &CancellationToken,
    shutdown_timeout: Duration,
    shutdown: impl Future<Output = Result<&'static str, BridgeAppError>>,
) -> Result<(), BridgeAppError> {
    let stop = tokio::select! {
        signal = shutdown => Stop::Signal(signal?),
        (task, error) = tasks.first_exit() => Stop::Exited(task, error),
    };
    match &stop {
        Stop::Signal(signal) => tracing::info!(signal, "received signal, shutting down..."),
        Stop::Exited(task, error) => {
            tracing::error!(%task, error = %error, "bridge task exited, shutting down...")
        }
    }

    token.cancel();

    // Drain: оставшаяся задача выходит на первой точке отмены
    let aborts = tasks.abort_handles();
    match tokio::time::timeout(shutdown_timeout, tasks.join()).await {
        Ok((transact, transform)) => {
            tracing::info!(transact = %transact, transform = %transform, "bridge tasks stopped");
        }
        Err(_) => {
            tracing::warn!(timeout = ?shutdown_timeout, "bridge tasks did not stop in time, aborting");
            for h in &aborts {
                h.abort();
            }
        }
    }

    match stop {
        Stop::Signal(_) => Ok(()),
        Stop::Exited(task, error) => Err(BridgeAppError::TaskExited { task, error }),
    }
}

async fn open_session(
    eff: &Effective,
) -> Result<(Box<dyn TransactSession>, Option<MemoryBroker>), BridgeAppError> {
    match eff.broker_kind {
        BrokerKind::Memory => {
            let broker = open_memory(eff)?;
            let session = broker.session(SessionConfig {
                group: eff.group.clone(),
                topics_in: vec![eff.topic_in.clone()],
                transactional_id: Some(eff.transactional_id.clone()),
                max_poll_records: eff.max_poll_records,
            });
            Ok((Box::new(session), Some(broker)))
        }
        BrokerKind::Kafka => Ok((open_kafka(eff).await?, None)),
    }
}

fn open_memory(eff: &Effective) -> Result<MemoryBroker, BridgeAppError> {
    let broker = MemoryBroker::new();
    broker.create_topic(&eff.topic_in, 1)?;
    broker.create_topic(&eff.topic_out, 1)?;

    if let Some(path) = &eff.seed_file {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeAppError::config("seed", format!("'{path}': {e}")))?;
        let mut seeded = 0usize;
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            broker.append(&eff.topic_in, 0, None, line.as_bytes().to_vec())?;
            seeded += 1;
        }
        tracing::info!(path = %path, records = seeded, topic = %eff.topic_in, "seeded memory broker");
    }
    Ok(broker)
}

#[cfg(feature = "kafka")]
async fn open_kafka(eff: &Effective) -> Result<Box<dyn TransactSession>, BridgeAppError> {
    let settings = crate::kafka::KafkaSettings::from_effective(eff);
    let session = crate::kafka::KafkaSession::connect(settings).await?;
    Ok(Box::new(session))
}

#[cfg(not(feature = "kafka"))]
async fn open_kafka(_eff: &Effective) -> Result<Box<dyn TransactSession>, BridgeAppError> {
    Err(BridgeAppError::config(
        "broker",
        "broker_kind = \"kafka\" requires eos-bridge built with --features kafka",
    ))
}

/// Закоммиченный выход memory-брокера в stdout, по записи на строку.
fn dump_output(broker: &MemoryBroker, topic: &str) {
    for record in broker.records(topic) {
        println!("{}", String::from_utf8_lossy(&record.value));
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str, BridgeAppError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            Ok("SIGINT")
        }
        _ = term.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str, BridgeAppError> {
    tokio::signal::ctrl_c().await?;
    Ok("SIGINT")
}

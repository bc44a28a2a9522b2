use std::sync::Arc;

use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Span;

use eos_api::{BridgeError, TransactSession, Transformer};

use crate::handoff;
use crate::metrics::Metrics;
use crate::transact::{LoopConfig, TransactionalLoop};
use crate::transform::TransformStage;

/// Какая из задач bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeTask {
    Transact,
    Transform,
}

impl std::fmt::Display for BridgeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeTask::Transact => f.write_str("transactional loop"),
            BridgeTask::Transform => f.write_str("transform stage"),
        }
    }
}

enum TaskSlot {
    Running(JoinHandle<BridgeError>),
    Done(BridgeError),
}

impl TaskSlot {
    async fn into_result(self, task: BridgeTask) -> BridgeError {
        match self {
            TaskSlot::Running(handle) => task_result(task, handle.await),
            TaskSlot::Done(err) => err,
        }
    }
}

// Паника или abort задачи превращается в `Io` ошибку.
fn task_result(task: BridgeTask, joined: Result<BridgeError, JoinError>) -> BridgeError {
    joined.unwrap_or_else(|e| BridgeError::io(format!("{task} task: {e}")))
}

/// Handles двух долгоживущих задач bridge.
pub struct BridgeTasks {
    transact: TaskSlot,
    transform: TaskSlot,
}

impl BridgeTasks {
    /// Abort handles ещё работающих задач, для shutdown timeout.
    pub fn abort_handles(&self) -> Vec<AbortHandle> {
        [&self.transact, &self.transform]
            .into_iter()
            .filter_map(|slot| match slot {
                TaskSlot::Running(handle) => Some(handle.abort_handle()),
                TaskSlot::Done(_) => None,
            })
            .collect()
    }

    /// Дождаться, пока завершится любая из задач. Повторный вызов сразу
    /// возвращает уже завершившуюся. `join` после этого остаётся корректным.
    pub async fn first_exit(&mut self) -> (BridgeTask, BridgeError) {
        let (task, err) = match (&mut self.transact, &mut self.transform) {
            (TaskSlot::Done(err), _) => return (BridgeTask::Transact, err.clone()),
            (_, TaskSlot::Done(err)) => return (BridgeTask::Transform, err.clone()),
            (TaskSlot::Running(transact), TaskSlot::Running(transform)) => tokio::select! {
                r = transact => (BridgeTask::Transact, task_result(BridgeTask::Transact, r)),
                r = transform => (BridgeTask::Transform, task_result(BridgeTask::Transform, r)),
            },
        };
        let done = TaskSlot::Done(err.clone());
        match task {
            BridgeTask::Transact => self.transact = done,
            BridgeTask::Transform => self.transform = done,
        }
        (task, err)
    }

    /// Barrier: дождаться обеих задач.
    pub async fn join(self) -> (BridgeError, BridgeError) {
        let transact = self.transact.into_result(BridgeTask::Transact).await;
        let transform = self.transform.into_result(BridgeTask::Transform).await;
        (transact, transform)
    }
}

/// Связать loop и stage через handoff и запустить обе задачи.
pub fn spawn_bridge(
    session: Box<dyn TransactSession>,
    transformer: Arc<dyn Transformer>,
    config: LoopConfig,
    metrics: Arc<Metrics>,
    token: CancellationToken,
) -> BridgeTasks {
    spawn_bridge_in(&Span::current(), session, transformer, config, metrics, token)
}

/// Как `spawn_bridge`, но span'ы `eos` и `rule_engine` создаются
/// дочерними к `parent`.
pub fn spawn_bridge_in(
    parent: &Span,
    session: Box<dyn TransactSession>,
    transformer: Arc<dyn Transformer>,
    config: LoopConfig,
    metrics: Arc<Metrics>,
    token: CancellationToken,
) -> BridgeTasks {
    let (loop_side, stage_side) = handoff::channel();

    let stage = TransformStage::new(stage_side, transformer)
        .with_span(tracing::info_span!(parent: parent, "rule_engine"));
    let transform = tokio::spawn(stage.run(token.clone()));

    let eos = TransactionalLoop::new(session, loop_side, config, metrics)
        .with_span(tracing::info_span!(parent: parent, "eos"));
    let transact = tokio::spawn(eos.run(token));

    BridgeTasks {
        transact: TaskSlot::Running(transact),
        transform: TaskSlot::Running(transform),
    }
}

pub mod bridge;
pub mod handoff;
pub mod memory;
pub mod metrics;
pub mod transact;
pub mod transform;

pub use bridge::{BridgeTask, BridgeTasks, spawn_bridge, spawn_bridge_in};
pub use handoff::{HandoffState, LoopHandle, StageHandle};
pub use memory::{MemoryBroker, MemorySession, SessionConfig};
pub use self::metrics::{DEFAULT_NAMESPACE, Metrics};
pub use transact::{LoopConfig, TransactionalLoop};
pub use transform::{DEFAULT_STAGE_NAME, RuleTransformer, TransformStage, local_timestamp};

#[derive(Debug, thiserror::Error)]
pub enum BridgeAppError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("{0}")]
    Bridge(#[from] eos_api::BridgeError),

    #[error("{task} stopped: {error}")]
    TaskExited { task: eos_engine::BridgeTask, error: eos_api::BridgeError },

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}

impl BridgeAppError {
    pub fn config(context: &'static str, detail: impl Into<String>) -> Self {
        Self::Config { context, detail: detail.into() }
    }
}

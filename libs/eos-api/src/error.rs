/// Category of a bridge error. Lets the loop decide what an error means
/// for the current record, the current transaction or the whole task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration: permanent, fail at startup.
    Config,
    /// I/O, network or closed channel: transient from the loop's view.
    Io,
    /// Payload could not be decoded or encoded.
    Format,
    /// Session protocol misuse (begin inside a transaction, non-transactional session).
    Session,
    /// A produce failed; aborts the enclosing transaction only.
    Produce,
    /// Cooperative shutdown. Expected, not an application error.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Config => f.write_str("config"),
            ErrorKind::Io => f.write_str("io"),
            ErrorKind::Format => f.write_str("format"),
            ErrorKind::Session => f.write_str("session"),
            ErrorKind::Produce => f.write_str("produce"),
            ErrorKind::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Unified error type for the bridge core and every `TransactSession`.
///
/// Carries an `ErrorKind` for categorization and a human-readable message.
/// `From` impls assign the appropriate kind automatically.
#[derive(Clone, PartialEq, Eq)]
pub struct BridgeError {
    kind: ErrorKind,
    message: String,
}

impl BridgeError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn format_err(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Format, msg)
    }

    pub fn session(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Session, msg)
    }

    pub fn produce(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Produce, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "context canceled")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Prepend context to the message, keeping the kind.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl std::fmt::Debug for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BridgeError {}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self { Self::new(ErrorKind::Io, e.to_string()) }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self { Self::new(ErrorKind::Format, e.to_string()) }
}

use thiserror::Error;

/// Every failure surface named in the core's error model (spec.md §7).
/// Leaf I/O and protocol errors from injected traits map onto one of
/// these before propagating to the owning work function.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("not found")]
    NotFound,

    #[error("could not acquire lock before timeout")]
    LockFailed,

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("unsupported artifact: {0}")]
    UnsupportedArtifact(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("flash error: {0}")]
    FlashError(String),

    #[error("storage full")]
    StorageFull,

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("invalid JSON")]
    Json(#[from] serde_json::Error),

    #[error("invalid binary-packed message: {0}")]
    MsgPackDecode(String),

    #[error("could not encode binary-packed message: {0}")]
    MsgPackEncode(String),

    #[error("i/o error")]
    Io(#[from] std::io::Error),
}

/// Outcome of a single work function invocation (spec.md §4.4). `Done`
/// causes the scheduler to stop that item's periodic timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    KeepScheduled,
    Done,
}

pub type AgentResult<T> = Result<T, AgentError>;

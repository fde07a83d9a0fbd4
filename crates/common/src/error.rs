use thiserror::Error;

/// Top-level error type for coordinator operations.
///
/// Variants map 1-to-1 onto the neutral error kinds of spec.md §7. Each is
/// surfaced to clients as `response{success:false,error}` unless recovered
/// locally (see `is_retryable`).
#[derive(Debug, Error)]
pub enum CoordinatorError {
    // --- Shared-state store errors ---
    #[error("shared-state store unavailable: {0}")]
    Unavailable(String),

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    // --- Ownership coordinator errors ---
    #[error("issue already owned by a different process: {0}")]
    Conflict(String),

    #[error("caller is not the recorded owner: {0}")]
    NotOwner(String),

    #[error("timed out acquiring issue lock: {0}")]
    LockTimeout(String),

    #[error("invalid ownership state transition: {0}")]
    InvalidTransition(String),

    // --- Resource manager errors ---
    #[error("concurrent worker limit reached for project {0}")]
    ConcurrentLimit(String),

    #[error("CPU quota exceeded for project {0}")]
    CpuExceeded(String),

    #[error("memory quota exceeded for project {0}")]
    MemoryExceeded(String),

    #[error("insufficient system-wide resources: {0}")]
    SystemResources(String),

    // --- Protocol / control-plane errors ---
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("authentication required")]
    AuthRequired,

    // --- Operational errors ---
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unrecoverable internal invariant violation: {0}")]
    Fatal(String),

    #[error("{0}")]
    Internal(String),
}

impl CoordinatorError {
    /// True for the four `QuotaError` subtypes of spec.md §7.
    pub fn is_quota_error(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentLimit(_)
                | Self::CpuExceeded(_)
                | Self::MemoryExceeded(_)
                | Self::SystemResources(_)
        )
    }

    /// Whether the caller may retry the same operation after a fresh read
    /// (store conflict) or a backoff (store outage, lock contention).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::TransactionConflict(_) | Self::LockTimeout(_)
        )
    }

    /// Whether this error should terminate the daemon (after persisting
    /// scheduler state) rather than merely fail the originating request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

use thiserror::Error;

/// Errors surfaced by the control-plane protocol layer (C5).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("authentication required")]
    AuthRequired,

    #[error("connection closed")]
    Closed,

    /// A command handler failed against one of the neutral kinds of
    /// spec.md §7. Kept distinct from `Frame` so the response sent back to
    /// the client can carry the original kind as its `error.code` instead
    /// of a blanket "Internal".
    #[error("{0}")]
    Coordinator(#[from] coordinator_common::CoordinatorError),
}

impl ProtocolError {
    /// The `error.code` a `response{success:false}` should carry for this
    /// error (spec.md §6 "Response" / §7 error kinds).
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Io(_) => "Io",
            ProtocolError::Frame(_) => "Frame",
            ProtocolError::Json(_) => "Json",
            ProtocolError::Timeout => "Timeout",
            ProtocolError::AuthRequired => "AuthRequired",
            ProtocolError::Closed => "Closed",
            ProtocolError::Coordinator(e) => coordinator_error_code(e),
        }
    }
}

fn coordinator_error_code(e: &coordinator_common::CoordinatorError) -> &'static str {
    use coordinator_common::CoordinatorError::*;
    match e {
        Unavailable(_) => "Unavailable",
        TransactionConflict(_) => "TransactionConflict",
        Conflict(_) => "Conflict",
        NotOwner(_) => "NotOwner",
        LockTimeout(_) => "LockTimeout",
        InvalidTransition(_) => "InvalidTransition",
        ConcurrentLimit(_) => "ConcurrentLimit",
        CpuExceeded(_) => "CpuExceeded",
        MemoryExceeded(_) => "MemoryExceeded",
        SystemResources(_) => "SystemResources",
        UnknownCommand(_) => "UnknownCommand",
        InvalidArgs(_) => "InvalidArgs",
        Timeout(_) => "Timeout",
        AuthRequired => "AuthRequired",
        Config(_) => "Config",
        Serialization(_) => "Serialization",
        NotFound(_) => "NotFound",
        Fatal(_) => "Fatal",
        Internal(_) => "Internal",
    }
}

impl From<ProtocolError> for coordinator_common::CoordinatorError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Timeout => coordinator_common::CoordinatorError::Timeout("request timed out".into()),
            ProtocolError::AuthRequired => coordinator_common::CoordinatorError::AuthRequired,
            ProtocolError::Coordinator(e) => e,
            other => coordinator_common::CoordinatorError::Internal(other.to_string()),
        }
    }
}

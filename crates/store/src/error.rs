use thiserror::Error;

/// Errors surfaced by the shared-state store client (C1).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),
}

impl From<StoreError> for coordinator_common::CoordinatorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Connection(msg) => coordinator_common::CoordinatorError::Unavailable(msg),
            StoreError::Command(msg) => coordinator_common::CoordinatorError::Unavailable(msg),
            StoreError::TransactionConflict(msg) => {
                coordinator_common::CoordinatorError::TransactionConflict(msg)
            }
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Command(e.to_string())
    }
}

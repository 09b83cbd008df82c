//! Brain error types
//!
//! Defines all errors that can occur while learning, speaking, or forgetting.

use thiserror::Error;

/// Errors that can occur in a brain
#[derive(Error, Debug)]
pub enum BrainError {
    /// No data is available to satisfy the request
    #[error("No data for tag {tag:?}")]
    NotFound { tag: String },

    /// Caller supplied an argument the brain cannot use
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend does not implement the requested operation
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: &'static str },

    /// Backing database failed
    #[error("Store error during {op}: {source}")]
    Store {
        op: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Could not obtain a database connection
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The operation was cancelled before it committed
    #[error("Operation cancelled")]
    Cancelled,

    /// A blocking worker was lost
    #[error("Task error: {0}")]
    Task(String),
}

impl BrainError {
    /// Wrap a database error with the operation it interrupted.
    ///
    /// Interrupted statements come from cancellation and are reported as such.
    pub fn store(op: impl Into<String>, source: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, _) = &source {
            if e.code == rusqlite::ErrorCode::OperationInterrupted {
                return BrainError::Cancelled;
            }
        }
        BrainError::Store {
            op: op.into(),
            source,
        }
    }

    /// Whether this error came from the backing store
    pub fn is_store(&self) -> bool {
        matches!(self, BrainError::Store { .. } | BrainError::Pool(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BrainError::NotFound { .. })
    }
}

impl From<tokio::task::JoinError> for BrainError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrainError::Task(err.to_string())
    }
}

/// Result type alias for brain operations
pub type BrainResult<T> = Result<T, BrainError>;

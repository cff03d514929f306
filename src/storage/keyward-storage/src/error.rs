//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or initialised.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A statement or engine call failed.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The caller supplied an unusable argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A batch precondition did not hold; nothing was written.
    #[error("write conflict on {0}")]
    Conflict(String),

    /// The backend did not answer in time.
    #[error("storage timeout: {0}")]
    Timeout(String),
}

impl StorageError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidInput(_))
    }
}

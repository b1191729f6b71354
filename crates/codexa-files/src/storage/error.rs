//! Object storage error types.

use thiserror::Error;

/// Result type for object storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while talking to object storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key is empty or otherwise unusable.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// IO error (local backend).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport failure reaching the remote endpoint.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote endpoint answered with an error status.
    #[error("{operation} {key} failed with status {status}: {body}")]
    Status {
        operation: &'static str,
        key: String,
        status: u16,
        body: String,
    },

    /// Backend misconfiguration or unexpected response.
    #[error("backend error: {0}")]
    Backend(String),
}

use thiserror::Error;

use crate::storage::StorageError;

/// Typed download errors enabling retry classification.
///
/// The `is_retryable()` method separates permanent rejections (bad request,
/// auth failures) from everything else, which is worth another attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP error {status} downloading {path}")]
    HttpStatus { status: u16, path: String },

    #[error("HTTP error downloading {path}: {source}")]
    Http {
        source: reqwest::Error,
        path: String,
    },

    #[error("Failed to store {path}: {source}")]
    Storage {
        path: String,
        source: StorageError,
    },

    #[error("Short body for {path}: expected {expected} bytes, got {received}")]
    Truncated {
        path: String,
        expected: u64,
        received: u64,
    },

    /// Streaming bodies cannot be replayed, so the op can never be retried.
    #[error("Request for {0} cannot be cloned")]
    RequestNotCloneable(String),
}

impl DownloadError {
    /// Whether this error is transient and worth retrying.
    ///
    /// Only 400, 401 and 403 are treated as final; any other status,
    /// transport failure or storage write error is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::HttpStatus { status, .. } => !matches!(status, 400 | 401 | 403),
            DownloadError::Http { .. } => true,
            DownloadError::Storage { .. } => true,
            DownloadError::Truncated { .. } => true,
            DownloadError::RequestNotCloneable(_) => false,
        }
    }
}

/// Errors from driving the pool itself rather than an individual download.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("Download pool is not running")]
    NotRunning,

    #[error("Download pool is already running")]
    AlreadyRunning,

    #[error("Download queue is closed")]
    QueueClosed,
}

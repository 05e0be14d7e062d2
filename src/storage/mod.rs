//! Byte storage for downloaded media behind one contract, on local disk or
//! in an S3-compatible bucket. Paths are always store-relative.

mod error;
mod local;
mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{StorageConfig, StorageKind};

pub use error::StorageError;
pub use local::LocalStorage;
pub use s3::S3Storage;

#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Prepare the backend: create the root directory or ensure the bucket.
    async fn init(&self) -> Result<(), StorageError>;

    /// Size in bytes, or `None` if nothing is stored at `path`.
    async fn stat(&self, path: &str) -> Result<Option<u64>, StorageError>;

    /// Copy `len` bytes (or everything) from `start` into `sink`. Returns
    /// `false` if nothing is stored at `path`.
    async fn get(
        &self,
        path: &str,
        start: u64,
        len: Option<u64>,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<bool, StorageError>;

    /// Store everything read from `source` at `path`, replacing any
    /// existing content. Returns the number of bytes written.
    async fn put(
        &self,
        path: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, StorageError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Remove `path`. Removing a missing path is not an error.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;
}

/// Reject anything that could escape the store root.
pub(crate) fn check_path(path: &str) -> Result<&str, StorageError> {
    let bad = path.is_empty()
        || path.contains('\\')
        || path
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        Err(StorageError::InvalidPath(path.to_string()))
    } else {
        Ok(path)
    }
}

/// Build and initialize the configured backend.
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    let storage: Arc<dyn Storage> = match config.kind {
        StorageKind::Local => Arc::new(LocalStorage::new(config.location.clone())),
        StorageKind::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                StorageError::Config("storage.type = \"s3\" requires a [storage.s3] table".into())
            })?;
            Arc::new(S3Storage::new(s3)?)
        }
    };
    storage.init().await?;
    tracing::debug!(?storage, "Storage ready");
    Ok(storage)
}

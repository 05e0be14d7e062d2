use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Absolute paths, `..` components and empty segments are rejected.
    #[error("Invalid storage path {0:?}")]
    InvalidPath(String),

    #[error("Object store {op} failed for {path}: {message}")]
    ObjectStore {
        op: &'static str,
        path: String,
        message: String,
    },

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub(crate) fn io(path: impl std::fmt::Display) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_string();
        move |source| Self::Io { path, source }
    }
}

//! Error types for the database layer.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while talking to either database backend.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to open or create the SQLite database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Could not check out a pooled PostgreSQL connection.
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Failed to create connection pool: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),

    /// A column held a value that does not fit the entity field.
    #[error("Cannot decode column {column}: {reason}")]
    Decode { column: String, reason: String },

    /// An update matched no rows.
    #[error("No rows updated in {table} for id {id}")]
    NoRowsUpdated { table: &'static str, id: String },

    /// An update named a column the entity does not have.
    #[error("Unknown column {column} for table {table}")]
    UnknownColumn { table: &'static str, column: String },

    /// The database schema version is newer than supported.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i64, expected: i64 },

    /// The transaction was already committed or rolled back.
    #[error("Transaction already finished")]
    TransactionFinished,

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error("Database migration to version {version} failed: {reason}")]
    Migration { version: i64, reason: String },
}

impl DbError {
    pub(crate) fn decode(column: &str, reason: impl Into<String>) -> Self {
        Self::Decode {
            column: column.to_string(),
            reason: reason.into(),
        }
    }
}

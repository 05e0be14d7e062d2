//! Database handle shared by the entity store, the sync driver and the
//! download callbacks.
//!
//! Two backends sit behind one [`Executor`] trait: a single SQLite
//! connection guarded by an async mutex, or a pooled PostgreSQL client.
//! A [`Transaction`] owns its connection for its whole lifetime, so it may
//! stay open across network calls; dropping it without `commit` or
//! `rollback` rolls it back.

mod error;
pub mod schema;
mod value;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{ManagerConfig, PoolConfig, RecyclingMethod, Runtime};
use tokio::sync::{Mutex, OwnedMutexGuard};

pub use error::DbError;
pub use value::{Row, SqlValue};

/// SQL dialect of the active backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Positional parameter marker, 1-indexed.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{n}"),
            Dialect::Postgres => format!("${n}"),
        }
    }

    fn begin_sql(self) -> &'static str {
        match self {
            // Take the write lock up front so a later write in the same
            // transaction cannot fail with SQLITE_BUSY.
            Dialect::Sqlite => "BEGIN IMMEDIATE",
            Dialect::Postgres => "BEGIN",
        }
    }
}

/// Statement execution shared by plain connections and transactions.
#[async_trait]
pub trait Executor: Send {
    fn dialect(&self) -> Dialect;

    /// Run a single statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError>;

    /// Run one or more parameterless statements.
    async fn batch(&mut self, sql: &str) -> Result<(), DbError>;

    async fn query_opt(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<Row>, DbError> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }
}

#[derive(Debug, Default)]
struct Counters {
    open_transactions: AtomicUsize,
    writes: AtomicU64,
}

#[derive(Clone)]
enum Backend {
    Sqlite {
        conn: Arc<Mutex<rusqlite::Connection>>,
        path: PathBuf,
    },
    Postgres(deadpool_postgres::Pool),
}

/// Cheaply cloneable database handle.
#[derive(Clone)]
pub struct Database {
    backend: Backend,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Database");
        match &self.backend {
            Backend::Sqlite { path, .. } => s.field("sqlite", path),
            Backend::Postgres(pool) => s.field("postgres_pool_size", &pool.status().max_size),
        };
        s.field("open_transactions", &self.open_transactions())
            .finish_non_exhaustive()
    }
}

pub(crate) fn is_postgres_url(url: &str) -> bool {
    url.starts_with("postgres://") || url.starts_with("postgresql://")
}

impl Database {
    /// Connect to `url`: a `postgres://` URL selects PostgreSQL, anything
    /// else is treated as a SQLite path (an optional `sqlite:` prefix is
    /// stripped). Pending migrations are applied.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self, DbError> {
        if is_postgres_url(url) {
            Self::connect_postgres(url, pool_size).await
        } else {
            let path = url.strip_prefix("sqlite:").unwrap_or(url);
            Self::open_sqlite(Path::new(path)).await
        }
    }

    /// Open or create a SQLite database at the given path.
    pub async fn open_sqlite(path: &Path) -> Result<Self, DbError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
            let conn =
                rusqlite::Connection::open(&path_clone).map_err(|e| DbError::Open {
                    path: path_clone.clone(),
                    source: e,
                })?;

            // WAL lets `status` and `verify` read while a sync is writing.
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;

            Ok::<_, DbError>(conn)
        })
        .await??;

        let db = Self::from_sqlite(conn, path);
        db.migrate().await?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, DbError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(|e| DbError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        let db = Self::from_sqlite(conn, PathBuf::from(":memory:"));
        db.migrate().await?;
        Ok(db)
    }

    fn from_sqlite(conn: rusqlite::Connection, path: PathBuf) -> Self {
        Self {
            backend: Backend::Sqlite {
                conn: Arc::new(Mutex::new(conn)),
                path,
            },
            counters: Arc::default(),
        }
    }

    /// Connect a PostgreSQL pool and verify one connection can be checked out.
    pub async fn connect_postgres(url: &str, pool_size: usize) -> Result<Self, DbError> {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.url = Some(url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(pool_size.max(1)));
        let pool = cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)?;
        drop(pool.get().await?);

        let db = Self {
            backend: Backend::Postgres(pool),
            counters: Arc::default(),
        };
        db.migrate().await?;
        Ok(db)
    }

    pub fn dialect(&self) -> Dialect {
        match self.backend {
            Backend::Sqlite { .. } => Dialect::Sqlite,
            Backend::Postgres(_) => Dialect::Postgres,
        }
    }

    /// Human-readable location for log lines.
    pub fn describe(&self) -> String {
        match &self.backend {
            Backend::Sqlite { path, .. } => format!("sqlite:{}", path.display()),
            Backend::Postgres(_) => "postgres".to_string(),
        }
    }

    /// Apply any pending schema migrations.
    pub async fn migrate(&self) -> Result<(), DbError> {
        schema::migrate(self).await
    }

    /// Check out a connection. With SQLite this holds the only connection
    /// until the returned value is dropped.
    pub async fn conn(&self) -> Result<Connection, DbError> {
        let inner = match &self.backend {
            Backend::Sqlite { conn, .. } => Inner::Sqlite(conn.clone().lock_owned().await),
            Backend::Postgres(pool) => Inner::Postgres(pool.get().await?),
        };
        Ok(Connection {
            inner,
            counters: self.counters.clone(),
        })
    }

    /// Start a transaction on a freshly checked-out connection.
    pub async fn begin(&self) -> Result<Transaction, DbError> {
        let mut conn = self.conn().await?;
        conn.batch(self.dialect().begin_sql()).await?;
        self.counters.open_transactions.fetch_add(1, Ordering::SeqCst);
        Ok(Transaction {
            conn: Some(conn),
            counters: self.counters.clone(),
        })
    }

    /// Transactions begun but not yet committed or rolled back.
    pub fn open_transactions(&self) -> usize {
        self.counters.open_transactions.load(Ordering::SeqCst)
    }

    /// Data-modifying statements issued through this handle.
    pub fn write_count(&self) -> u64 {
        self.counters.writes.load(Ordering::SeqCst)
    }
}

enum Inner {
    Sqlite(OwnedMutexGuard<rusqlite::Connection>),
    Postgres(deadpool_postgres::Object),
}

/// A checked-out connection.
pub struct Connection {
    inner: Inner,
    counters: Arc<Counters>,
}

fn sqlite_execute(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, DbError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let n = stmt.execute(rusqlite::params_from_iter(params.iter().map(value::to_sqlite)))?;
    Ok(n as u64)
}

fn sqlite_query(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>, DbError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(value::to_sqlite)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..columns.len())
            .map(|idx| {
                row.get::<_, rusqlite::types::Value>(idx)
                    .map(value::from_sqlite)
            })
            .collect::<Result<Vec<_>, _>>()?;
        out.push(Row::new(columns.clone(), values));
    }
    Ok(out)
}

fn pg_params(params: &[SqlValue]) -> Vec<value::PgParam> {
    params.iter().map(value::to_postgres).collect()
}

fn is_write(sql: &str) -> bool {
    let head = sql.trim_start().get(..6).unwrap_or("").to_ascii_uppercase();
    matches!(head.as_str(), "INSERT" | "UPDATE" | "DELETE")
}

#[async_trait]
impl Executor for Connection {
    fn dialect(&self) -> Dialect {
        match self.inner {
            Inner::Sqlite(_) => Dialect::Sqlite,
            Inner::Postgres(_) => Dialect::Postgres,
        }
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        if is_write(sql) {
            self.counters.writes.fetch_add(1, Ordering::SeqCst);
        }
        match &mut self.inner {
            Inner::Sqlite(conn) => sqlite_execute(conn, sql, params),
            Inner::Postgres(client) => {
                let owned = pg_params(params);
                let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = owned
                    .iter()
                    .map(|p| &**p as &(dyn tokio_postgres::types::ToSql + Sync))
                    .collect();
                Ok(client.execute(sql, &refs).await?)
            }
        }
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        match &mut self.inner {
            Inner::Sqlite(conn) => sqlite_query(conn, sql, params),
            Inner::Postgres(client) => {
                let owned = pg_params(params);
                let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = owned
                    .iter()
                    .map(|p| &**p as &(dyn tokio_postgres::types::ToSql + Sync))
                    .collect();
                let rows = client.query(sql, &refs).await?;
                rows.iter().map(Row::from_postgres).collect()
            }
        }
    }

    async fn batch(&mut self, sql: &str) -> Result<(), DbError> {
        match &mut self.inner {
            Inner::Sqlite(conn) => Ok(conn.execute_batch(sql)?),
            Inner::Postgres(client) => Ok(client.batch_execute(sql).await?),
        }
    }
}

impl Connection {
    /// Roll back an abandoned transaction without awaiting.
    fn rollback_detached(self) {
        match self.inner {
            Inner::Sqlite(conn) => {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %e, "Rollback of dropped transaction failed");
                }
            }
            Inner::Postgres(client) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = client.batch_execute("ROLLBACK").await {
                            tracing::warn!(error = %e, "Rollback of dropped transaction failed");
                        }
                    });
                }
                // Detach from the pool and close; the server discards the
                // transaction with the session.
                Err(_) => drop(deadpool_postgres::Object::take(client)),
            },
        }
    }
}

/// An open transaction owning its connection.
///
/// Finish it with [`Transaction::commit`] or [`Transaction::rollback`];
/// dropping it rolls back.
pub struct Transaction {
    conn: Option<Connection>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl Transaction {
    fn conn_mut(&mut self) -> Result<&mut Connection, DbError> {
        self.conn.as_mut().ok_or(DbError::TransactionFinished)
    }

    fn release(&mut self) -> Option<Connection> {
        let conn = self.conn.take();
        if conn.is_some() {
            self.counters
                .open_transactions
                .fetch_sub(1, Ordering::SeqCst);
        }
        conn
    }

    pub async fn commit(mut self) -> Result<(), DbError> {
        self.conn_mut()?.batch("COMMIT").await?;
        self.release();
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), DbError> {
        let result = self.conn_mut()?.batch("ROLLBACK").await;
        self.release();
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(conn) = self.release() {
            tracing::debug!("Rolling back dropped transaction");
            conn.rollback_detached();
        }
    }
}

#[async_trait]
impl Executor for Transaction {
    fn dialect(&self) -> Dialect {
        self.conn
            .as_ref()
            .map_or(Dialect::Sqlite, |c| c.dialect())
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        self.conn_mut()?.execute(sql, params).await
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        self.conn_mut()?.query(sql, params).await
    }

    async fn batch(&mut self, sql: &str) -> Result<(), DbError> {
        self.conn_mut()?.batch(sql).await
    }
}

/// Look up a single integer, e.g. a `COUNT(*)`.
pub async fn query_count(
    exec: &mut dyn Executor,
    sql: &str,
    params: &[SqlValue],
) -> Result<i64, DbError> {
    match exec.query_opt(sql, params).await? {
        Some(row) => row.int("n"),
        None => Ok(0),
    }
}

//! Entity store: maps typed records onto rows through a static column
//! descriptor per entity, for either SQL dialect.
//!
//! Upsert semantics differ between backends. SQLite expresses them with
//! `INSERT OR IGNORE` / `INSERT OR REPLACE`; PostgreSQL with
//! `ON CONFLICT DO NOTHING` / `ON CONFLICT (id) DO UPDATE SET ...` restating
//! every column.

mod record;
pub mod validate;

use thiserror::Error;
use uuid::Uuid;

use crate::db::{DbError, Dialect, Executor, Row, SqlValue};
use crate::types::Source;

pub use record::{ForUpdate, Record};
pub use validate::ValidationError;

/// One column of an entity's table.
pub struct Column<E> {
    pub name: &'static str,
    /// Primary key column used for conflicts and updates.
    pub identity: bool,
    pub get: fn(&E) -> SqlValue,
}

impl<E> Column<E> {
    /// The primary key column.
    pub const fn key(name: &'static str, get: fn(&E) -> SqlValue) -> Self {
        Self {
            name,
            identity: true,
            get,
        }
    }

    pub const fn new(name: &'static str, get: fn(&E) -> SqlValue) -> Self {
        Self {
            name,
            identity: false,
            get,
        }
    }
}

/// What to do when an insert hits an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePolicy {
    InsertOnly,
    IgnoreOnDuplicate,
    ReplaceOnDuplicate,
}

pub trait Entity: Sized + Send + Sync + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static [Column<Self>];
    /// Policy used when a [`Record`] is saved.
    const SAVE_POLICY: SavePolicy = SavePolicy::ReplaceOnDuplicate;

    fn id(&self) -> Uuid;
    fn from_row(row: &Row) -> Result<Self, DbError>;
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Entities addressed by the remote `(source, source_id)` pair.
pub trait SourceEntity: Entity {
    /// A fresh, unsaved instance with a new random id.
    fn create(source: Source, source_id: &str) -> Self;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid {table} record: {source}")]
    Invalid {
        table: &'static str,
        source: ValidationError,
    },

    #[error(transparent)]
    Database(#[from] DbError),
}

fn identity_column<E: Entity>() -> &'static str {
    E::COLUMNS
        .iter()
        .find(|c| c.identity)
        .map_or("id", |c| c.name)
}

fn column_list<E: Entity>() -> String {
    E::COLUMNS
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build the insert statement for `columns` under `policy`.
pub fn build_insert(
    dialect: Dialect,
    table: &str,
    columns: &[&str],
    identity: &str,
    policy: SavePolicy,
) -> String {
    let names = columns.join(", ");
    let marks = (1..=columns.len())
        .map(|n| dialect.placeholder(n))
        .collect::<Vec<_>>()
        .join(", ");

    match dialect {
        Dialect::Sqlite => {
            let verb = match policy {
                SavePolicy::InsertOnly => "INSERT",
                SavePolicy::IgnoreOnDuplicate => "INSERT OR IGNORE",
                SavePolicy::ReplaceOnDuplicate => "INSERT OR REPLACE",
            };
            format!("{verb} INTO {table} ({names}) VALUES ({marks})")
        }
        Dialect::Postgres => {
            let base = format!("INSERT INTO {table} ({names}) VALUES ({marks})");
            match policy {
                SavePolicy::InsertOnly => base,
                SavePolicy::IgnoreOnDuplicate => format!("{base} ON CONFLICT DO NOTHING"),
                SavePolicy::ReplaceOnDuplicate => {
                    let set = columns
                        .iter()
                        .enumerate()
                        .map(|(i, c)| format!("{c} = {}", dialect.placeholder(i + 1)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("{base} ON CONFLICT ({identity}) DO UPDATE SET {set}")
                }
            }
        }
    }
}

/// Build `UPDATE table SET a = ?1, b = ?2 WHERE id = ?3`.
pub fn build_update(dialect: Dialect, table: &str, columns: &[&str], identity: &str) -> String {
    let set = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{c} = {}", dialect.placeholder(i + 1)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {table} SET {set} WHERE {identity} = {}",
        dialect.placeholder(columns.len() + 1)
    )
}

fn validated<E: Entity>(entity: &E) -> Result<(), StoreError> {
    entity.validate().map_err(|source| StoreError::Invalid {
        table: E::TABLE,
        source,
    })
}

/// Validate and write `entity`. Returns whether a row was written.
pub async fn save<E: Entity>(
    exec: &mut dyn Executor,
    entity: &E,
    policy: SavePolicy,
) -> Result<bool, StoreError> {
    validated(entity)?;
    let names: Vec<&str> = E::COLUMNS.iter().map(|c| c.name).collect();
    let values: Vec<SqlValue> = E::COLUMNS.iter().map(|c| (c.get)(entity)).collect();
    let sql = build_insert(
        exec.dialect(),
        E::TABLE,
        &names,
        identity_column::<E>(),
        policy,
    );
    let written = exec.execute(&sql, &values).await?;
    tracing::trace!(table = E::TABLE, id = %entity.id(), written, "Saved row");
    Ok(written > 0)
}

/// Insert `entity` if absent, otherwise write only `changed` columns.
pub async fn update<E: Entity>(
    exec: &mut dyn Executor,
    entity: &E,
    changed: &[&str],
) -> Result<(), StoreError> {
    let mut columns = Vec::with_capacity(changed.len());
    for name in changed {
        let column = E::COLUMNS
            .iter()
            .find(|c| c.name == *name)
            .ok_or_else(|| DbError::UnknownColumn {
                table: E::TABLE,
                column: name.to_string(),
            })?;
        columns.push(column);
    }

    if save(exec, entity, SavePolicy::IgnoreOnDuplicate).await? || columns.is_empty() {
        return Ok(());
    }

    let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
    let mut values: Vec<SqlValue> = columns.iter().map(|c| (c.get)(entity)).collect();
    values.push(SqlValue::Text(entity.id().to_string()));
    let sql = build_update(exec.dialect(), E::TABLE, &names, identity_column::<E>());
    if exec.execute(&sql, &values).await? == 0 {
        return Err(DbError::NoRowsUpdated {
            table: E::TABLE,
            id: entity.id().to_string(),
        }
        .into());
    }
    Ok(())
}

pub async fn find_by_id<E: Entity>(
    exec: &mut dyn Executor,
    id: Uuid,
) -> Result<Option<E>, DbError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = {}",
        column_list::<E>(),
        E::TABLE,
        identity_column::<E>(),
        exec.dialect().placeholder(1)
    );
    match exec.query_opt(&sql, &[SqlValue::Text(id.to_string())]).await? {
        Some(row) => Ok(Some(E::from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn find_by_source<E: SourceEntity>(
    exec: &mut dyn Executor,
    source: Source,
    source_id: &str,
) -> Result<Option<E>, DbError> {
    let dialect = exec.dialect();
    let sql = format!(
        "SELECT {} FROM {} WHERE source = {} AND source_id = {}",
        column_list::<E>(),
        E::TABLE,
        dialect.placeholder(1),
        dialect.placeholder(2)
    );
    let params = [SqlValue::Int(source.bits()), SqlValue::from(source_id)];
    match exec.query_opt(&sql, &params).await? {
        Some(row) => Ok(Some(E::from_row(&row)?)),
        None => Ok(None),
    }
}

/// Parse a stored UUID column.
pub fn uuid_column(row: &Row, column: &str) -> Result<Uuid, DbError> {
    let raw = row.text(column)?;
    Uuid::parse_str(&raw).map_err(|e| DbError::Decode {
        column: column.to_string(),
        reason: format!("{raw:?}: {e}"),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::Database;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Note {
        pub id: Uuid,
        pub source: Source,
        pub source_id: String,
        pub body: String,
    }

    fn note_id(n: &Note) -> SqlValue {
        SqlValue::Text(n.id.to_string())
    }
    fn note_source(n: &Note) -> SqlValue {
        SqlValue::Int(n.source.bits())
    }
    fn note_source_id(n: &Note) -> SqlValue {
        SqlValue::Text(n.source_id.clone())
    }
    fn note_body(n: &Note) -> SqlValue {
        SqlValue::Text(n.body.clone())
    }

    impl Entity for Note {
        const TABLE: &'static str = "notes";
        const COLUMNS: &'static [Column<Self>] = &[
            Column::key("id", note_id),
            Column::new("source", note_source),
            Column::new("source_id", note_source_id),
            Column::new("body", note_body),
        ];

        fn id(&self) -> Uuid {
            self.id
        }

        fn from_row(row: &Row) -> Result<Self, DbError> {
            Ok(Self {
                id: uuid_column(row, "id")?,
                source: Source::from_bits(row.int("source")?),
                source_id: row.text("source_id")?,
                body: row.text("body")?,
            })
        }

        fn validate(&self) -> Result<(), ValidationError> {
            validate::check_source_key(&self.id, self.source, &self.source_id)
        }
    }

    impl SourceEntity for Note {
        fn create(source: Source, source_id: &str) -> Self {
            Self {
                id: Uuid::new_v4(),
                source,
                source_id: source_id.to_string(),
                body: String::new(),
            }
        }
    }

    pub(crate) async fn notes_db() -> Database {
        let db = Database::open_in_memory().await.unwrap();
        let mut conn = db.conn().await.unwrap();
        conn.batch(
            "CREATE TABLE notes (id TEXT PRIMARY KEY, source INTEGER NOT NULL, \
             source_id TEXT NOT NULL, body TEXT NOT NULL, UNIQUE (source, source_id))",
        )
        .await
        .unwrap();
        drop(conn);
        db
    }

    #[test]
    fn test_sqlite_insert_verbs() {
        let cols = ["id", "a"];
        assert_eq!(
            build_insert(Dialect::Sqlite, "t", &cols, "id", SavePolicy::InsertOnly),
            "INSERT INTO t (id, a) VALUES (?1, ?2)"
        );
        assert_eq!(
            build_insert(Dialect::Sqlite, "t", &cols, "id", SavePolicy::IgnoreOnDuplicate),
            "INSERT OR IGNORE INTO t (id, a) VALUES (?1, ?2)"
        );
        assert_eq!(
            build_insert(Dialect::Sqlite, "t", &cols, "id", SavePolicy::ReplaceOnDuplicate),
            "INSERT OR REPLACE INTO t (id, a) VALUES (?1, ?2)"
        );
    }

    #[test]
    fn test_postgres_conflict_clauses() {
        let cols = ["id", "a"];
        assert_eq!(
            build_insert(Dialect::Postgres, "t", &cols, "id", SavePolicy::IgnoreOnDuplicate),
            "INSERT INTO t (id, a) VALUES ($1, $2) ON CONFLICT DO NOTHING"
        );
        assert_eq!(
            build_insert(Dialect::Postgres, "t", &cols, "id", SavePolicy::ReplaceOnDuplicate),
            "INSERT INTO t (id, a) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET id = $1, a = $2"
        );
    }

    #[test]
    fn test_update_statement() {
        assert_eq!(
            build_update(Dialect::Postgres, "media", &["location", "hash"], "id"),
            "UPDATE media SET location = $1, hash = $2 WHERE id = $3"
        );
        assert_eq!(
            build_update(Dialect::Sqlite, "media", &["location"], "id"),
            "UPDATE media SET location = ?1 WHERE id = ?2"
        );
    }

    #[tokio::test]
    async fn test_save_policies_sqlite() {
        let db = notes_db().await;
        let mut conn = db.conn().await.unwrap();
        let mut note = Note::create(Source::FEED, "n1");
        note.body = "first".into();

        assert!(save(&mut conn, &note, SavePolicy::InsertOnly).await.unwrap());
        assert!(save(&mut conn, &note, SavePolicy::InsertOnly).await.is_err());

        note.body = "second".into();
        assert!(!save(&mut conn, &note, SavePolicy::IgnoreOnDuplicate)
            .await
            .unwrap());
        let stored: Note = find_by_id(&mut conn, note.id).await.unwrap().unwrap();
        assert_eq!(stored.body, "first");

        assert!(save(&mut conn, &note, SavePolicy::ReplaceOnDuplicate)
            .await
            .unwrap());
        let stored: Note = find_by_id(&mut conn, note.id).await.unwrap().unwrap();
        assert_eq!(stored.body, "second");
    }

    #[tokio::test]
    async fn test_save_rejects_invalid() {
        let db = notes_db().await;
        let mut conn = db.conn().await.unwrap();
        let note = Note::create(Source::IMPORTED, "n1");
        let err = save(&mut conn, &note, SavePolicy::InsertOnly)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Invalid {
                table: "notes",
                source: ValidationError::InvalidSource(_)
            }
        ));
    }

    #[tokio::test]
    async fn test_update_inserts_then_updates() {
        let db = notes_db().await;
        let mut conn = db.conn().await.unwrap();
        let mut note = Note::create(Source::BOARD, "n2");
        note.body = "a".into();
        update(&mut conn, &note, &["body"]).await.unwrap();

        note.body = "b".into();
        update(&mut conn, &note, &["body"]).await.unwrap();
        let stored: Note = find_by_source(&mut conn, Source::BOARD, "n2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, note);
    }

    #[tokio::test]
    async fn test_update_zero_rows_is_error() {
        let db = notes_db().await;
        let mut conn = db.conn().await.unwrap();
        let mut first = Note::create(Source::FEED, "n4");
        first.body = "kept".into();
        save(&mut conn, &first, SavePolicy::InsertOnly).await.unwrap();

        // Same remote key under a different id: the insert is ignored and the
        // update matches no row.
        let mut second = Note::create(Source::FEED, "n4");
        second.body = "lost".into();
        let err = update(&mut conn, &second, &["body"]).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Database(DbError::NoRowsUpdated { table: "notes", .. })
        ));

        let stored: Note = find_by_id(&mut conn, first.id).await.unwrap().unwrap();
        assert_eq!(stored.body, "kept");
        let missing: Option<Note> = find_by_id(&mut conn, second.id).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_column() {
        let db = notes_db().await;
        let mut conn = db.conn().await.unwrap();
        let note = Note::create(Source::FEED, "n3");
        let err = update(&mut conn, &note, &["nope"]).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Database(DbError::UnknownColumn { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_missing() {
        let db = notes_db().await;
        let mut conn = db.conn().await.unwrap();
        let found: Option<Note> = find_by_id(&mut conn, Uuid::new_v4()).await.unwrap();
        assert!(found.is_none());
        let found: Option<Note> = find_by_source(&mut conn, Source::FEED, "x")
            .await
            .unwrap();
        assert!(found.is_none());
    }
}

//! Database schema definitions and migrations.
//!
//! The `migrations` table holds a single integer version. Each entry in
//! [`MIGRATIONS`] moves the schema forward by one step and is applied in its
//! own transaction together with the version bump.

use super::error::DbError;
use super::{Database, Dialect, Executor};

type Migration = fn(Dialect) -> String;

/// Ordered migration steps. Never reorder or edit a released step.
const MIGRATIONS: &[Migration] = &[
    create_tables,
    create_lookup_indexes,
    add_original_urls,
];

/// Current schema version.
pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

fn int_type(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => "INTEGER",
        Dialect::Postgres => "BIGINT",
    }
}

fn list_type(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => "TEXT",
        Dialect::Postgres => "TEXT[]",
    }
}

fn content_table(dialect: Dialect, table: &str) -> String {
    let int = int_type(dialect);
    let list = list_type(dialect);
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id TEXT NOT NULL PRIMARY KEY,
    source {int} NOT NULL,
    source_id TEXT NOT NULL,
    author TEXT NOT NULL,
    date {int} NOT NULL,
    text TEXT NOT NULL DEFAULT '',
    media {list},
    UNIQUE (source, source_id)
);
"#
    )
}

fn create_tables(dialect: Dialect) -> String {
    let int = int_type(dialect);
    let mut ddl = format!(
        r#"
CREATE TABLE IF NOT EXISTS profiles (
    id TEXT NOT NULL PRIMARY KEY,
    source {int} NOT NULL,
    source_id TEXT NOT NULL,
    username TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    avatar TEXT NOT NULL DEFAULT '',
    header TEXT NOT NULL DEFAULT '',
    last_scrape {int} NOT NULL DEFAULT 0,
    UNIQUE (source, source_id)
);

CREATE TABLE IF NOT EXISTS media (
    id TEXT NOT NULL PRIMARY KEY,
    source {int} NOT NULL,
    source_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    visible {int} NOT NULL DEFAULT 0,
    location TEXT NOT NULL DEFAULT '',
    preview TEXT NOT NULL DEFAULT '',
    hash TEXT NOT NULL DEFAULT '',
    preview_hash TEXT NOT NULL DEFAULT '',
    UNIQUE (source, source_id)
);
"#
    );
    for table in ["posts", "messages", "stories"] {
        ddl.push_str(&content_table(dialect, table));
    }
    ddl
}

fn create_lookup_indexes(_dialect: Dialect) -> String {
    r#"
CREATE INDEX IF NOT EXISTS idx_media_hash ON media(hash);
CREATE INDEX IF NOT EXISTS idx_media_preview_hash ON media(preview_hash);
CREATE INDEX IF NOT EXISTS idx_posts_author ON posts(author);
CREATE INDEX IF NOT EXISTS idx_messages_author ON messages(author);
CREATE INDEX IF NOT EXISTS idx_stories_author ON stories(author);
"#
    .to_string()
}

fn add_original_urls(_dialect: Dialect) -> String {
    r#"
ALTER TABLE media ADD COLUMN original_location TEXT NOT NULL DEFAULT '';
ALTER TABLE media ADD COLUMN original_preview TEXT NOT NULL DEFAULT '';
"#
    .to_string()
}

/// Get the current schema version from the database.
pub(crate) async fn get_schema_version(db: &Database) -> Result<i64, DbError> {
    let mut conn = db.conn().await?;
    conn.batch(&format!(
        "CREATE TABLE IF NOT EXISTS migrations (version {} NOT NULL)",
        int_type(db.dialect())
    ))
    .await?;
    match conn.query_opt("SELECT version FROM migrations", &[]).await? {
        Some(row) => row.int("version"),
        None => {
            conn.execute("INSERT INTO migrations (version) VALUES (0)", &[])
                .await?;
            Ok(0)
        }
    }
}

/// Initialize or migrate the database schema.
///
/// This function is idempotent and safe to call on both new and existing databases.
pub(crate) async fn migrate(db: &Database) -> Result<(), DbError> {
    let current_version = get_schema_version(db).await?;

    if current_version > SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    let dialect = db.dialect();
    for (idx, step) in MIGRATIONS.iter().enumerate().skip(current_version as usize) {
        let version = idx as i64 + 1;
        let mut tx = db.begin().await?;
        tx.batch(&step(dialect)).await.map_err(|e| DbError::Migration {
            version,
            reason: e.to_string(),
        })?;
        let sql = format!("UPDATE migrations SET version = {}", dialect.placeholder(1));
        tx.execute(&sql, &[version.into()]).await?;
        tx.commit().await?;
        tracing::info!(version, "Migrated database schema");
    }

    Ok(())
}

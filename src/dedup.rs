//! Content-addressed deduplication of downloaded media.
//!
//! A finished download is looked up by its SHA-256 among existing media
//! (both full files and previews). On a hit the fresh copy is deleted and
//! the media row points at the file already stored.
//!
//! Two downloads of the same bytes finishing at the same moment can both
//! miss the lookup and both be kept. That costs space, not correctness.

use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, Executor, SqlValue};
use crate::models::{Media, MediaSlot};
use crate::storage::Storage;
use crate::store::{self, StoreError};

#[derive(Debug, Error)]
pub enum DedupError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A stored file whose bytes hash to the looked-up value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashMatch {
    pub media_id: Uuid,
    pub path: String,
}

fn find_by_hash_sql(exec: &dyn Executor) -> String {
    let p = exec.dialect().placeholder(1);
    format!(
        "SELECT id, location AS path FROM media WHERE hash = {p} AND location <> '' \
         UNION ALL \
         SELECT id, preview AS path FROM media WHERE preview_hash = {p} AND preview <> '' \
         LIMIT 1"
    )
}

/// Any media file or preview already stored with this hash.
pub async fn find_by_hash(
    exec: &mut dyn Executor,
    hash: &str,
) -> Result<Option<HashMatch>, DbError> {
    if hash.is_empty() {
        return Ok(None);
    }
    let sql = find_by_hash_sql(exec);
    let Some(row) = exec.query_opt(&sql, &[SqlValue::from(hash)]).await? else {
        return Ok(None);
    };
    Ok(Some(HashMatch {
        media_id: store::uuid_column(&row, "id")?,
        path: row.text("path")?,
    }))
}

/// Record a finished download of `url`, reusing an identical stored file
/// when one exists. Returns the location the media row now points at.
///
/// Deduplication is best effort: if the lookup or the removal of the fresh
/// copy fails, the fresh copy is recorded instead.
pub async fn record_media_download(
    db: &Database,
    storage: &dyn Storage,
    media_id: Uuid,
    slot: MediaSlot,
    url: &str,
    written: &str,
    hash: &str,
) -> Result<String, DedupError> {
    let existing = match lookup(db, hash).await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(media = %media_id, path = %written, "Duplicate lookup failed: {}", e);
            None
        }
    };

    let location = match existing {
        Some(found) if found.path != written => match storage.delete(written).await {
            Ok(()) => {
                tracing::debug!(
                    media = %media_id,
                    existing = %found.path,
                    duplicate_of = %found.media_id,
                    "Duplicate content, removed {}",
                    written
                );
                found.path
            }
            Err(e) => {
                tracing::warn!(
                    media = %media_id,
                    path = %written,
                    "Keeping duplicate of {}: {}",
                    found.path,
                    e
                );
                written.to_string()
            }
        },
        _ => written.to_string(),
    };

    Media::record_download(db, media_id, slot, url, &location, hash).await?;
    Ok(location)
}

async fn lookup(db: &Database, hash: &str) -> Result<Option<HashMatch>, DbError> {
    let mut conn = db.conn().await?;
    find_by_hash(&mut conn, hash).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStorage, StorageError};
    use crate::store::Record;
    use crate::types::Source;
    use async_trait::async_trait;
    use tokio::io::{AsyncRead, AsyncWrite};

    const URL: &str = "https://cdn/a.jpg?token=1";

    async fn setup() -> (tempfile::TempDir, LocalStorage, Database) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());
        storage.init().await.unwrap();
        let db = Database::open_in_memory().await.unwrap();
        (dir, storage, db)
    }

    async fn new_media(db: &Database, source_id: &str) -> Uuid {
        let mut conn = db.conn().await.unwrap();
        let mut rec: Record<Media> = Record::find(&mut conn, Source::FEED, source_id)
            .await
            .unwrap();
        rec.set(|m| &mut m.visible, true);
        rec.save(&mut conn).await.unwrap();
        rec.id
    }

    async fn load(db: &Database, id: Uuid) -> Media {
        let mut conn = db.conn().await.unwrap();
        Record::<Media>::load(&mut conn, id)
            .await
            .unwrap()
            .unwrap()
            .into_inner()
    }

    async fn put(storage: &dyn Storage, path: &str, body: &[u8]) {
        let mut body = body;
        storage.put(path, &mut body).await.unwrap();
    }

    /// Local storage that refuses to delete anything.
    #[derive(Debug)]
    struct NoDelete(LocalStorage);

    #[async_trait]
    impl Storage for NoDelete {
        async fn init(&self) -> Result<(), StorageError> {
            self.0.init().await
        }

        async fn stat(&self, path: &str) -> Result<Option<u64>, StorageError> {
            self.0.stat(path).await
        }

        async fn get(
            &self,
            path: &str,
            start: u64,
            len: Option<u64>,
            sink: &mut (dyn AsyncWrite + Unpin + Send),
        ) -> Result<bool, StorageError> {
            self.0.get(path, start, len, sink).await
        }

        async fn put(
            &self,
            path: &str,
            source: &mut (dyn AsyncRead + Unpin + Send),
        ) -> Result<u64, StorageError> {
            self.0.put(path, source).await
        }

        async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
            self.0.rename(from, to).await
        }

        async fn delete(&self, path: &str) -> Result<(), StorageError> {
            Err(StorageError::io(path)(std::io::Error::other("read-only")))
        }
    }

    #[tokio::test]
    async fn test_empty_hash_never_matches() {
        let (_dir, _storage, db) = setup().await;
        new_media(&db, "https://cdn/a.jpg").await;
        let mut conn = db.conn().await.unwrap();
        assert_eq!(find_by_hash(&mut conn, "").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_hash_is_not_found() {
        let (_dir, _storage, db) = setup().await;
        let mut conn = db.conn().await.unwrap();
        assert_eq!(find_by_hash(&mut conn, "abc123").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_first_download_keeps_its_file() {
        let (_dir, storage, db) = setup().await;
        let id = new_media(&db, "https://cdn/a.jpg").await;
        put(&storage, "aa/bb/first.jpg", b"same").await;

        let location = record_media_download(
            &db,
            &storage,
            id,
            MediaSlot::Location,
            URL,
            "aa/bb/first.jpg",
            "h1",
        )
        .await
        .unwrap();
        assert_eq!(location, "aa/bb/first.jpg");
        assert_eq!(storage.stat("aa/bb/first.jpg").await.unwrap(), Some(4));

        let media = load(&db, id).await;
        assert_eq!(media.location, "aa/bb/first.jpg");
        assert_eq!(media.hash, "h1");
        assert_eq!(media.original_location, "https://cdn/a.jpg");

        let mut conn = db.conn().await.unwrap();
        assert_eq!(
            find_by_hash(&mut conn, "h1").await.unwrap(),
            Some(HashMatch {
                media_id: id,
                path: "aa/bb/first.jpg".into()
            })
        );
    }

    #[tokio::test]
    async fn test_duplicate_content_stored_once() {
        let (_dir, storage, db) = setup().await;
        let first = new_media(&db, "https://cdn/a.jpg").await;
        let second = new_media(&db, "https://cdn/b.jpg").await;

        put(&storage, "aa/bb/first.jpg", b"same").await;
        record_media_download(
            &db,
            &storage,
            first,
            MediaSlot::Location,
            URL,
            "aa/bb/first.jpg",
            "h1",
        )
        .await
        .unwrap();

        put(&storage, "cc/dd/second.jpg", b"same").await;
        let location = record_media_download(
            &db,
            &storage,
            second,
            MediaSlot::Location,
            "https://cdn/b.jpg",
            "cc/dd/second.jpg",
            "h1",
        )
        .await
        .unwrap();

        assert_eq!(location, "aa/bb/first.jpg");
        assert_eq!(storage.stat("cc/dd/second.jpg").await.unwrap(), None);
        assert_eq!(storage.stat("aa/bb/first.jpg").await.unwrap(), Some(4));
        let media = load(&db, second).await;
        assert_eq!(media.location, "aa/bb/first.jpg");
        assert_eq!(media.hash, "h1");
        assert_eq!(media.original_location, "https://cdn/b.jpg");
    }

    #[tokio::test]
    async fn test_preview_matches_full_file() {
        let (_dir, storage, db) = setup().await;
        let first = new_media(&db, "https://cdn/clip.mp4").await;
        let second = new_media(&db, "https://cdn/pic.jpg").await;

        put(&storage, "aa/bb/thumb.jpg", b"thumb").await;
        record_media_download(
            &db,
            &storage,
            first,
            MediaSlot::Preview,
            "https://cdn/clip_thumb.jpg",
            "aa/bb/thumb.jpg",
            "t1",
        )
        .await
        .unwrap();

        put(&storage, "ee/ff/full.jpg", b"thumb").await;
        let location = record_media_download(
            &db,
            &storage,
            second,
            MediaSlot::Location,
            "https://cdn/pic.jpg",
            "ee/ff/full.jpg",
            "t1",
        )
        .await
        .unwrap();
        assert_eq!(location, "aa/bb/thumb.jpg");
        assert_eq!(storage.stat("ee/ff/full.jpg").await.unwrap(), None);

        let media = load(&db, second).await;
        assert_eq!(media.location, "aa/bb/thumb.jpg");
        assert_eq!(media.preview, "");
        assert_eq!(load(&db, first).await.original_preview, "https://cdn/clip_thumb.jpg");
    }

    #[tokio::test]
    async fn test_failed_duplicate_removal_keeps_fresh_copy() {
        let dir = tempfile::tempdir().unwrap();
        let storage = NoDelete(LocalStorage::new(dir.path().to_path_buf()));
        storage.init().await.unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let first = new_media(&db, "https://cdn/one.jpg").await;
        let second = new_media(&db, "https://cdn/two.jpg").await;

        put(&storage, "aa/bb/one.jpg", b"same").await;
        record_media_download(
            &db,
            &storage,
            first,
            MediaSlot::Location,
            "https://cdn/one.jpg",
            "aa/bb/one.jpg",
            "h1",
        )
        .await
        .unwrap();

        put(&storage, "cc/dd/two.jpg", b"same").await;
        let location = record_media_download(
            &db,
            &storage,
            second,
            MediaSlot::Location,
            "https://cdn/two.jpg",
            "cc/dd/two.jpg",
            "h1",
        )
        .await
        .unwrap();

        assert_eq!(location, "cc/dd/two.jpg");
        assert_eq!(storage.stat("cc/dd/two.jpg").await.unwrap(), Some(4));
        let media = load(&db, second).await;
        assert_eq!(media.location, "cc/dd/two.jpg");
        assert_eq!(media.hash, "h1");
    }
}

use uuid::Uuid;

use crate::db::{Database, DbError, Row, SqlValue};
use crate::download::paths;
use crate::store::{self, validate, Column, Entity, ForUpdate, SourceEntity, StoreError};
use crate::store::ValidationError;
use crate::types::{MediaKind, Source};

/// A media file referenced by posts, messages or stories.
///
/// `location`/`preview` stay empty until the corresponding download has
/// completed; `hash`/`preview_hash` are the hex SHA-256 of those bytes and
/// `original_*` the remote URLs they came from, without query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub id: Uuid,
    pub source: Source,
    pub source_id: String,
    pub kind: MediaKind,
    pub visible: bool,
    pub location: String,
    pub preview: String,
    pub hash: String,
    pub preview_hash: String,
    pub original_location: String,
    pub original_preview: String,
}

/// The two downloadable renditions of a media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSlot {
    Location,
    Preview,
}

impl MediaSlot {
    /// Columns written when a download for this slot completes.
    pub fn columns(&self) -> [&'static str; 3] {
        match self {
            Self::Location => ["location", "hash", "original_location"],
            Self::Preview => ["preview", "preview_hash", "original_preview"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Location => "location",
            Self::Preview => "preview",
        }
    }
}

fn id(m: &Media) -> SqlValue {
    SqlValue::Text(m.id.to_string())
}
fn source(m: &Media) -> SqlValue {
    SqlValue::Int(m.source.bits())
}
fn source_id(m: &Media) -> SqlValue {
    SqlValue::from(m.source_id.as_str())
}
fn kind(m: &Media) -> SqlValue {
    SqlValue::from(m.kind.as_str())
}
fn visible(m: &Media) -> SqlValue {
    SqlValue::from(m.visible)
}
fn location(m: &Media) -> SqlValue {
    SqlValue::from(m.location.as_str())
}
fn preview(m: &Media) -> SqlValue {
    SqlValue::from(m.preview.as_str())
}
fn hash(m: &Media) -> SqlValue {
    SqlValue::from(m.hash.as_str())
}
fn preview_hash(m: &Media) -> SqlValue {
    SqlValue::from(m.preview_hash.as_str())
}
fn original_location(m: &Media) -> SqlValue {
    SqlValue::from(m.original_location.as_str())
}
fn original_preview(m: &Media) -> SqlValue {
    SqlValue::from(m.original_preview.as_str())
}

impl Entity for Media {
    const TABLE: &'static str = "media";
    const COLUMNS: &'static [Column<Self>] = &[
        Column::key("id", id),
        Column::new("source", source),
        Column::new("source_id", source_id),
        Column::new("kind", kind),
        Column::new("visible", visible),
        Column::new("location", location),
        Column::new("preview", preview),
        Column::new("hash", hash),
        Column::new("preview_hash", preview_hash),
        Column::new("original_location", original_location),
        Column::new("original_preview", original_preview),
    ];

    fn id(&self) -> Uuid {
        self.id
    }

    fn from_row(row: &Row) -> Result<Self, DbError> {
        let raw_kind = row.text("kind")?;
        let kind = MediaKind::from_str(&raw_kind).ok_or_else(|| DbError::Decode {
            column: "kind".to_string(),
            reason: format!("unknown media kind {raw_kind:?}"),
        })?;
        Ok(Self {
            id: store::uuid_column(row, "id")?,
            source: Source::from_bits(row.int("source")?),
            source_id: row.text("source_id")?,
            kind,
            visible: row.int("visible")? != 0,
            location: row.text("location")?,
            preview: row.text("preview")?,
            hash: row.text("hash")?,
            preview_hash: row.text("preview_hash")?,
            original_location: row.text("original_location")?,
            original_preview: row.text("original_preview")?,
        })
    }

    fn validate(&self) -> Result<(), ValidationError> {
        validate::check_source_key(&self.id, self.source, &self.source_id)
    }
}

impl SourceEntity for Media {
    fn create(source: Source, source_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            source_id: source_id.to_string(),
            kind: MediaKind::Photo,
            visible: false,
            location: String::new(),
            preview: String::new(),
            hash: String::new(),
            preview_hash: String::new(),
            original_location: String::new(),
            original_preview: String::new(),
        }
    }
}

impl Media {
    pub fn slot_location(&self, slot: MediaSlot) -> &str {
        match slot {
            MediaSlot::Location => &self.location,
            MediaSlot::Preview => &self.preview,
        }
    }

    /// Record a finished download of `url` for `slot` in its own transaction.
    pub async fn record_download(
        db: &Database,
        id: Uuid,
        slot: MediaSlot,
        url: &str,
        location: &str,
        hash: &str,
    ) -> Result<(), StoreError> {
        let mut fu: ForUpdate<Media> = ForUpdate::load(db, id).await?.ok_or_else(|| {
            StoreError::Database(DbError::NoRowsUpdated {
                table: Media::TABLE,
                id: id.to_string(),
            })
        })?;
        let (location, hash) = (location.to_string(), hash.to_string());
        let original = paths::strip_query(url).to_string();
        match slot {
            MediaSlot::Location => {
                fu.set(|m| &mut m.location, location);
                fu.set(|m| &mut m.hash, hash);
                fu.set(|m| &mut m.original_location, original);
            }
            MediaSlot::Preview => {
                fu.set(|m| &mut m.preview, location);
                fu.set(|m| &mut m.preview_hash, hash);
                fu.set(|m| &mut m.original_preview, original);
            }
        }
        fu.update(&slot.columns()).await
    }
}

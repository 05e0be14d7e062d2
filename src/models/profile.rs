use uuid::Uuid;

use crate::db::{Database, DbError, Row, SqlValue};
use crate::store::{self, validate, Column, Entity, ForUpdate, SourceEntity, StoreError};
use crate::store::ValidationError;
use crate::types::Source;

/// A tracked remote account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: Uuid,
    pub source: Source,
    pub source_id: String,
    pub username: String,
    pub name: String,
    /// Store-relative location of the avatar image, empty until downloaded.
    pub avatar: String,
    pub header: String,
    /// Unix seconds of the last completed pass, 0 for never.
    pub last_scrape: i64,
}

/// Which profile image a download fills in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileImage {
    Avatar,
    Header,
}

impl ProfileImage {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Avatar => "avatar",
            Self::Header => "header",
        }
    }
}

fn id(p: &Profile) -> SqlValue {
    SqlValue::Text(p.id.to_string())
}
fn source(p: &Profile) -> SqlValue {
    SqlValue::Int(p.source.bits())
}
fn source_id(p: &Profile) -> SqlValue {
    SqlValue::from(p.source_id.as_str())
}
fn username(p: &Profile) -> SqlValue {
    SqlValue::from(p.username.as_str())
}
fn name(p: &Profile) -> SqlValue {
    SqlValue::from(p.name.as_str())
}
fn avatar(p: &Profile) -> SqlValue {
    SqlValue::from(p.avatar.as_str())
}
fn header(p: &Profile) -> SqlValue {
    SqlValue::from(p.header.as_str())
}
fn last_scrape(p: &Profile) -> SqlValue {
    SqlValue::Int(p.last_scrape)
}

impl Entity for Profile {
    const TABLE: &'static str = "profiles";
    const COLUMNS: &'static [Column<Self>] = &[
        Column::key("id", id),
        Column::new("source", source),
        Column::new("source_id", source_id),
        Column::new("username", username),
        Column::new("name", name),
        Column::new("avatar", avatar),
        Column::new("header", header),
        Column::new("last_scrape", last_scrape),
    ];

    fn id(&self) -> Uuid {
        self.id
    }

    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            id: store::uuid_column(row, "id")?,
            source: Source::from_bits(row.int("source")?),
            source_id: row.text("source_id")?,
            username: row.text("username")?,
            name: row.text("name")?,
            avatar: row.text("avatar")?,
            header: row.text("header")?,
            last_scrape: row.int("last_scrape")?,
        })
    }

    fn validate(&self) -> Result<(), ValidationError> {
        validate::check_source_key(&self.id, self.source, &self.source_id)?;
        if self.username.is_empty() {
            return Err(ValidationError::EmptyUsername);
        }
        if self.last_scrape < 0 {
            return Err(ValidationError::InvalidTimestamp {
                field: "last_scrape",
                value: self.last_scrape,
            });
        }
        Ok(())
    }
}

impl SourceEntity for Profile {
    fn create(source: Source, source_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            source_id: source_id.to_string(),
            username: String::new(),
            name: String::new(),
            avatar: String::new(),
            header: String::new(),
            last_scrape: 0,
        }
    }
}

async fn load_or_missing(db: &Database, id: Uuid) -> Result<ForUpdate<Profile>, StoreError> {
    ForUpdate::load(db, id).await?.ok_or_else(|| {
        StoreError::Database(DbError::NoRowsUpdated {
            table: Profile::TABLE,
            id: id.to_string(),
        })
    })
}

impl Profile {
    /// Record where a downloaded avatar or header was stored.
    pub async fn record_image(
        db: &Database,
        id: Uuid,
        slot: ProfileImage,
        location: &str,
    ) -> Result<(), StoreError> {
        let mut fu = load_or_missing(db, id).await?;
        let value = location.to_string();
        match slot {
            ProfileImage::Avatar => fu.set(|p| &mut p.avatar, value),
            ProfileImage::Header => fu.set(|p| &mut p.header, value),
        };
        fu.update(&[slot.column()]).await
    }

    /// Stamp the end of a sync pass.
    pub async fn mark_scraped(db: &Database, id: Uuid, at: i64) -> Result<(), StoreError> {
        let mut fu = load_or_missing(db, id).await?;
        fu.set(|p| &mut p.last_scrape, at);
        fu.update(&["last_scrape"]).await
    }
}

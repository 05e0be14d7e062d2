//! Posts, messages and story items share one shape and differ only by table.

use std::marker::PhantomData;

use uuid::Uuid;

use super::MediaList;
use crate::db::{DbError, Row, SqlValue};
use crate::store::{self, validate, Column, Entity, SourceEntity, ValidationError};
use crate::types::{ContentKind, Source};

pub trait ContentTable: std::fmt::Debug + Clone + PartialEq + Send + Sync + 'static {
    const TABLE: &'static str;
    const KIND: ContentKind;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posts;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Messages;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stories;

impl ContentTable for Posts {
    const TABLE: &'static str = "posts";
    const KIND: ContentKind = ContentKind::Posts;
}

impl ContentTable for Messages {
    const TABLE: &'static str = "messages";
    const KIND: ContentKind = ContentKind::Messages;
}

impl ContentTable for Stories {
    const TABLE: &'static str = "stories";
    const KIND: ContentKind = ContentKind::Stories;
}

/// An authored item with ordered media references.
#[derive(Debug, Clone, PartialEq)]
pub struct Content<K> {
    pub id: Uuid,
    pub source: Source,
    pub source_id: String,
    /// Profile id of the author.
    pub author: Uuid,
    /// Unix seconds.
    pub date: i64,
    pub text: String,
    pub media: MediaList,
    table: PhantomData<K>,
}

fn id<K>(c: &Content<K>) -> SqlValue {
    SqlValue::Text(c.id.to_string())
}
fn source<K>(c: &Content<K>) -> SqlValue {
    SqlValue::Int(c.source.bits())
}
fn source_id<K>(c: &Content<K>) -> SqlValue {
    SqlValue::from(c.source_id.as_str())
}
fn author<K>(c: &Content<K>) -> SqlValue {
    SqlValue::Text(c.author.to_string())
}
fn date<K>(c: &Content<K>) -> SqlValue {
    SqlValue::Int(c.date)
}
fn text<K>(c: &Content<K>) -> SqlValue {
    SqlValue::from(c.text.as_str())
}
fn media<K>(c: &Content<K>) -> SqlValue {
    c.media.to_sql()
}

impl<K: ContentTable> Entity for Content<K> {
    const TABLE: &'static str = K::TABLE;
    const COLUMNS: &'static [Column<Self>] = &[
        Column::key("id", id::<K>),
        Column::new("source", source::<K>),
        Column::new("source_id", source_id::<K>),
        Column::new("author", author::<K>),
        Column::new("date", date::<K>),
        Column::new("text", text::<K>),
        Column::new("media", media::<K>),
    ];

    fn id(&self) -> Uuid {
        self.id
    }

    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            id: store::uuid_column(row, "id")?,
            source: Source::from_bits(row.int("source")?),
            source_id: row.text("source_id")?,
            author: store::uuid_column(row, "author")?,
            date: row.int("date")?,
            text: row.text("text")?,
            media: MediaList::from_row(row, "media")?,
            table: PhantomData,
        })
    }

    fn validate(&self) -> Result<(), ValidationError> {
        validate::check_source_key(&self.id, self.source, &self.source_id)?;
        validate::check_id("author", &self.author)?;
        validate::check_positive("date", self.date)?;
        self.media.validate()
    }
}

impl<K: ContentTable> SourceEntity for Content<K> {
    fn create(source: Source, source_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            source_id: source_id.to_string(),
            author: Uuid::nil(),
            date: 0,
            text: String::new(),
            media: MediaList::default(),
            table: PhantomData,
        }
    }
}

impl<K: ContentTable> Content<K> {
    pub fn kind(&self) -> ContentKind {
        K::KIND
    }
}

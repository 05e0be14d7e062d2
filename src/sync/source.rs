//! The contract between the sync driver and a remote content service.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::types::{ContentKind, Pagination, Source};

#[derive(Debug, Error)]
pub enum SourceError {
    /// Credentials were rejected; retrying will not help.
    #[error("Authentication rejected for {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("Unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl SourceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Where the next page starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Offset(usize),
    /// Items strictly older than this id; `None` for the newest page.
    Before(Option<String>),
}

impl Cursor {
    pub fn start(pagination: Pagination) -> Self {
        match pagination {
            Pagination::Offset => Self::Offset(0),
            Pagination::BeforeId => Self::Before(None),
        }
    }

    /// Cursor for the page after `page`, which started at `self`.
    pub fn advance(&self, page: &[RemoteItem]) -> Self {
        match self {
            Self::Offset(offset) => Self::Offset(offset + page.len()),
            Self::Before(before) => {
                Self::Before(page.last().map(|item| item.id.clone()).or_else(|| before.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteProfile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub header: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    /// Source id of the authoring profile.
    pub author: String,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media: Vec<RemoteMedia>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteMedia {
    /// Stable id; when absent the URL without its query string is used.
    #[serde(default)]
    pub id: Option<String>,
    pub url: String,
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(default = "default_visible")]
    pub visible: bool,
    /// `photo`, `video`, `gif` or `audio`; inferred from the URL when absent.
    #[serde(default)]
    pub kind: Option<String>,
}

fn default_visible() -> bool {
    true
}

/// A remote service the driver can page through.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source(&self) -> Source;

    fn pagination(&self) -> Pagination;

    async fn fetch_profile(&self, source_id: &str) -> Result<RemoteProfile, SourceError>;

    /// One page of items, newest first.
    async fn list_items(
        &self,
        kind: ContentKind,
        profile: &str,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Vec<RemoteItem>, SourceError>;

    /// Request for a media URL, with whatever auth the source needs.
    fn media_request(&self, url: &str) -> Result<reqwest::Request, SourceError>;
}

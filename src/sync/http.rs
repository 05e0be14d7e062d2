//! JSON-over-HTTP source client.
//!
//! `GET {base}/profiles/{id}` returns the profile and
//! `GET {base}/profiles/{id}/{kind}?limit=N&offset=M` (or `&before=ID`)
//! returns `{"items": [...]}`, newest first.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, USER_AGENT as USER_AGENT_HEADER};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::source::{Cursor, RemoteItem, RemoteProfile, SourceClient, SourceError};
use crate::retry::{self, RetryAction, RetryConfig, RetryError};
use crate::types::{ContentKind, Pagination, Source};

pub const USER_AGENT: &str = concat!("feedmirror/", env!("CARGO_PKG_VERSION"));

const REQUEST_TIMEOUT: Duration = Duration::from_secs(40);

/// Rate-limited responses are retried twice before giving up.
const RATE_LIMIT_RETRY: RetryConfig = RetryConfig {
    max_retries: 2,
    base_delay_secs: 5,
    max_delay_secs: 30,
};

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    items: Vec<RemoteItem>,
}

enum FetchError {
    RateLimited(String),
    Failed(SourceError),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited(url) => write!(f, "rate limited by {url}"),
            Self::Failed(e) => write!(f, "{e}"),
        }
    }
}

pub struct HttpSource {
    client: Client,
    base_url: String,
    token: Option<String>,
    source: Source,
    pagination: Pagination,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSource")
            .field("base_url", &self.base_url)
            .field("source", &self.source)
            .field("pagination", &self.pagination)
            .finish_non_exhaustive()
    }
}

impl HttpSource {
    pub fn new(
        source: Source,
        base_url: &str,
        token: Option<String>,
        pagination: Pagination,
        cancel: CancellationToken,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            source,
            pagination,
            retry: RATE_LIMIT_RETRY,
            cancel,
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header(USER_AGENT_HEADER, HeaderValue::from_static(USER_AGENT));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn url(&self, path: &str) -> Result<Url, SourceError> {
        let raw = format!("{}{}", self.base_url, path);
        Url::parse(&raw).map_err(|e| SourceError::Transport {
            url: raw,
            message: e.to_string(),
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, url: &Url) -> Result<T, FetchError> {
        let shown = url.to_string();
        let transport = |message: String| {
            FetchError::Failed(SourceError::Transport {
                url: shown.clone(),
                message,
            })
        };
        let response = self
            .authorized(self.client.get(url.clone()))
            .send()
            .await
            .map_err(|e| transport(e.to_string()))?;

        match response.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FetchError::Failed(SourceError::Auth(shown.clone())))
            }
            StatusCode::NOT_FOUND => {
                return Err(FetchError::Failed(SourceError::NotFound(shown.clone())))
            }
            StatusCode::TOO_MANY_REQUESTS => return Err(FetchError::RateLimited(shown.clone())),
            s => return Err(transport(format!("HTTP {s}"))),
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| transport(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| {
            FetchError::Failed(SourceError::Decode {
                url: shown.clone(),
                message: e.to_string(),
            })
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, SourceError> {
        tracing::debug!(url = %url, "GET");
        let result = retry::retry_with_backoff(
            &self.retry,
            &self.cancel,
            |e: &FetchError| match e {
                FetchError::RateLimited(_) => RetryAction::Retry,
                FetchError::Failed(_) => RetryAction::Abort,
            },
            || self.fetch(&url),
        )
        .await;
        match result {
            Ok(value) => Ok(value),
            Err(RetryError::Cancelled) => Err(SourceError::Transport {
                url: url.to_string(),
                message: "cancelled".into(),
            }),
            Err(RetryError::Aborted(FetchError::Failed(e))) => Err(e),
            Err(e) => Err(SourceError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl SourceClient for HttpSource {
    fn source(&self) -> Source {
        self.source
    }

    fn pagination(&self) -> Pagination {
        self.pagination
    }

    async fn fetch_profile(&self, source_id: &str) -> Result<RemoteProfile, SourceError> {
        let url = self.url(&format!("/profiles/{source_id}"))?;
        self.get_json(url).await
    }

    async fn list_items(
        &self,
        kind: ContentKind,
        profile: &str,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Vec<RemoteItem>, SourceError> {
        let mut url = self.url(&format!("/profiles/{profile}/{}", kind.as_str()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            match cursor {
                Cursor::Offset(offset) => {
                    query.append_pair("offset", &offset.to_string());
                }
                Cursor::Before(Some(id)) => {
                    query.append_pair("before", id);
                }
                Cursor::Before(None) => {}
            }
        }
        let page: Page = self.get_json(url).await?;
        Ok(page.items)
    }

    fn media_request(&self, url: &str) -> Result<reqwest::Request, SourceError> {
        self.authorized(self.client.get(url))
            .build()
            .map_err(|e| SourceError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })
    }
}

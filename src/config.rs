use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::db::is_postgres_url;
use crate::retry::RetryConfig;
use crate::types::{ContentKind, Pagination, Source};

pub const DEFAULT_CONFIG_PATH: &str = "feedmirror.toml";
const DEFAULT_DATA_PATH: &str = "~/.feedmirror";

/// Application configuration, loaded from TOML.
///
/// Every key is optional. Paths may start with `~/`; call
/// [`Config::resolve`] once after loading to expand them and fill in the
/// defaults derived from `data_path`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub data_path: PathBuf,
    /// `postgres://...` or a SQLite path (optionally `sqlite:`-prefixed).
    pub database: Option<String>,
    pub postgres_pool_size: usize,
    pub storage: StorageConfig,
    pub download: DownloadSettings,
    pub sync: SyncSettings,
    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            database: None,
            postgres_pool_size: 4,
            storage: StorageConfig::default(),
            download: DownloadSettings::default(),
            sync: SyncSettings::default(),
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Local,
    S3,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    /// Root directory for local storage. Defaults to `<data_path>/files`.
    pub location: PathBuf,
    pub s3: Option<S3Settings>,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3Settings {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub path_style: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("path_style", &self.path_style)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadSettings {
    pub workers: usize,
    pub queue: usize,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub max_delay_secs: u64,
    pub timeout_secs: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            workers: 3,
            queue: 12,
            max_retries: retry.max_retries,
            retry_delay_secs: retry.base_delay_secs,
            max_delay_secs: retry.max_delay_secs,
            timeout_secs: 120,
        }
    }
}

impl DownloadSettings {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_secs: self.retry_delay_secs,
            max_delay_secs: self.max_delay_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    pub page_size: usize,
    pub skip_posts: bool,
    pub skip_messages: bool,
    pub skip_stories: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 10,
            skip_posts: false,
            skip_messages: false,
            skip_stories: false,
        }
    }
}

impl SyncSettings {
    /// Enabled content kinds, in sync order.
    pub fn kinds(&self) -> Vec<ContentKind> {
        ContentKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                ContentKind::Posts => !self.skip_posts,
                ContentKind::Messages => !self.skip_messages,
                ContentKind::Stories => !self.skip_stories,
            })
            .collect()
    }
}

/// One remote service and the profiles tracked on it.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    pub source: Source,
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default)]
    pub profiles: Vec<String>,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("pagination", &self.pagination)
            .field("profiles", &self.profiles)
            .finish()
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => expand_tilde(s),
        None => path.to_path_buf(),
    }
}

impl Config {
    /// Load `path`. A missing file is only acceptable for the default path,
    /// in which case built-in defaults are used.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::debug!("No {} found, using defaults", path.display());
                return Self::default().resolve();
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        Self::parse(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.resolve()
    }

    /// Expand `~/`, derive defaults from `data_path`, and validate.
    pub fn resolve(mut self) -> anyhow::Result<Self> {
        self.data_path = expand_path(&self.data_path);

        self.database = Some(match self.database.take() {
            Some(url) if is_postgres_url(&url) => url,
            Some(path) => {
                let path = path.strip_prefix("sqlite:").unwrap_or(&path);
                format!("sqlite:{}", expand_tilde(path).display())
            }
            None => format!("sqlite:{}", self.data_path.join("data.db").display()),
        });

        if self.storage.location.as_os_str().is_empty() {
            self.storage.location = self.data_path.join("files");
        } else {
            self.storage.location = expand_path(&self.storage.location);
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.storage.kind == StorageKind::S3 && self.storage.s3.is_none() {
            anyhow::bail!("storage.type is \"s3\" but [storage.s3] is missing");
        }
        if self.download.workers == 0 {
            anyhow::bail!("download.workers must be at least 1");
        }
        if self.download.queue == 0 {
            anyhow::bail!("download.queue must be at least 1");
        }
        if self.sync.page_size == 0 {
            anyhow::bail!("sync.page_size must be at least 1");
        }
        if self.postgres_pool_size == 0 {
            anyhow::bail!("postgres_pool_size must be at least 1");
        }
        for (i, source) in self.sources.iter().enumerate() {
            if !source.source.is_valid() {
                anyhow::bail!(
                    "sources.{} ({}): source \"{}\" cannot be synced",
                    i,
                    source.name,
                    source.source
                );
            }
            if source.base_url.is_empty() {
                anyhow::bail!("sources.{} ({}): base_url is empty", i, source.name);
            }
            if self.sources[..i].iter().any(|s| s.name == source.name) {
                anyhow::bail!("sources.{}: duplicate name \"{}\"", i, source.name);
            }
        }
        Ok(())
    }

    /// Resolved database URL.
    pub fn database_url(&self) -> &str {
        self.database.as_deref().unwrap_or_default()
    }
}

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata},
    primitives::ByteStream,
    Client as S3Client, Config as S3Config,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{check_path, Storage, StorageError};
use crate::config::S3Settings;

/// Objects in one S3-compatible bucket, keyed by store-relative path.
///
/// Uploads are buffered in memory; a single `put_object` is atomic from a
/// reader's point of view.
pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

fn store_err(op: &'static str, path: &str, err: impl std::error::Error) -> StorageError {
    StorageError::ObjectStore {
        op,
        path: path.to_string(),
        message: DisplayErrorContext(err).to_string(),
    }
}

/// HTTP `Range` header value for a byte window.
fn range_header(start: u64, len: Option<u64>) -> Option<String> {
    match (start, len) {
        (0, None) => None,
        (start, None) => Some(format!("bytes={start}-")),
        (start, Some(len)) => Some(format!(
            "bytes={start}-{}",
            start.saturating_add(len.max(1) - 1)
        )),
    }
}

impl S3Storage {
    pub fn new(settings: &S3Settings) -> Result<Self, StorageError> {
        if settings.bucket.is_empty() {
            return Err(StorageError::Config("storage.s3.bucket is empty".into()));
        }
        let credentials = Credentials::new(
            settings.access_key.clone(),
            settings.secret_key.clone(),
            None,
            None,
            "feedmirror",
        );
        let mut builder = S3Config::builder()
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(settings.path_style);
        if let Some(endpoint) = settings.endpoint.clone() {
            builder = builder.endpoint_url(endpoint);
        }
        Ok(Self {
            client: S3Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
        })
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn init(&self) -> Result<(), StorageError> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }
        tracing::info!(bucket = %self.bucket, "Creating bucket");
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| store_err("create_bucket", &self.bucket, e))?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<Option<u64>, StorageError> {
        let key = check_path(path)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => Ok(Some(head.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(store_err("head_object", path, e)),
        }
    }

    async fn get(
        &self,
        path: &str,
        start: u64,
        len: Option<u64>,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<bool, StorageError> {
        let key = check_path(path)?;
        if len == Some(0) {
            return Ok(self.stat(path).await?.is_some());
        }
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range_header(start, len))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Ok(false)
            }
            // A window starting past the end reads as empty, as it does locally.
            Err(e) if e.code() == Some("InvalidRange") => {
                sink.flush().await.map_err(StorageError::io(path))?;
                return Ok(true);
            }
            Err(e) => return Err(store_err("get_object", path, e)),
        };
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| store_err("get_object", path, e))?;
        sink.write_all(&data.into_bytes())
            .await
            .map_err(StorageError::io(path))?;
        sink.flush().await.map_err(StorageError::io(path))?;
        Ok(true)
    }

    async fn put(
        &self,
        path: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, StorageError> {
        let key = check_path(path)?;
        let mut buf = Vec::new();
        source
            .read_to_end(&mut buf)
            .await
            .map_err(StorageError::io(path))?;
        let size = buf.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(buf))
            .send()
            .await
            .map_err(|e| store_err("put_object", path, e))?;
        Ok(size)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let src = check_path(from)?;
        let dest = check_path(to)?;
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src))
            .key(dest)
            .send()
            .await
            .map_err(|e| store_err("copy_object", from, e))?;
        self.delete(from).await
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let key = check_path(path)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_err("delete_object", path, e))?;
        Ok(())
    }
}

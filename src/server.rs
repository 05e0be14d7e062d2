//! Read-only HTTP access to stored media.
//!
//! `GET` and `HEAD` on `/file/<store path>` with single-range support, so
//! browsers and players can seek in stored videos.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::download::paths;
use crate::storage::{Storage, StorageError};

const PIPE_BUFFER: usize = 64 * 1024;

/// A single satisfiable byte window of a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub len: u64,
}

impl ByteRange {
    fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.start + self.len - 1, size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Malformed, or more than one range.
    Invalid,
    /// Well formed, but starts at or past the end of the file.
    Unsatisfiable,
}

/// Parse a `Range` header against a file of `size` bytes.
///
/// Accepts `bytes=a-b`, `bytes=a-` and `bytes=-n`. An end past the file is
/// clamped to the last byte.
pub fn parse_range(value: &str, size: u64) -> Result<ByteRange, RangeError> {
    let spec = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Invalid)?
        .trim();
    if spec.contains(',') {
        return Err(RangeError::Invalid);
    }
    let (first, last) = spec.split_once('-').ok_or(RangeError::Invalid)?;
    let (first, last) = (first.trim(), last.trim());
    let number = |s: &str| {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RangeError::Invalid);
        }
        s.parse::<u64>().map_err(|_| RangeError::Invalid)
    };

    if first.is_empty() {
        let suffix = number(last)?;
        if suffix == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        let len = suffix.min(size);
        return Ok(ByteRange {
            start: size - len,
            len,
        });
    }

    let start = number(first)?;
    let end = if last.is_empty() {
        None
    } else {
        let end = number(last)?;
        if end < start {
            return Err(RangeError::Invalid);
        }
        Some(end)
    };
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }
    let end = end.map_or(size - 1, |end| end.min(size - 1));
    Ok(ByteRange {
        start,
        len: end - start + 1,
    })
}

/// Content type for a stored path, from its extension.
pub fn content_type(path: &str) -> &'static str {
    match paths::file_extension(path).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        Some("heif") => "image/heif",
        Some("mp4" | "m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    }
}

pub fn router(storage: Arc<dyn Storage>) -> Router {
    Router::new()
        .route("/file/{*path}", get(serve_file))
        .with_state(storage)
}

/// Serve until `cancel` fires.
pub async fn serve(
    storage: Arc<dyn Storage>,
    listen: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!("Serving stored files on http://{}", listener.local_addr()?);
    axum::serve(listener, router(storage))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn serve_file(
    State(storage): State<Arc<dyn Storage>>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    let size = match storage.stat(&path).await {
        Ok(Some(size)) => size,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(StorageError::InvalidPath(_)) => return Err(StatusCode::BAD_REQUEST),
        Err(e) => {
            tracing::error!(path = %path, "Failed to stat: {}", e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let requested = headers
        .get(header::RANGE)
        .map(|v| v.to_str().map_err(|_| RangeError::Invalid))
        .transpose()
        .and_then(|v| v.map(|v| parse_range(v, size)).transpose());
    let range = match requested {
        Ok(range) => range,
        Err(RangeError::Invalid) => return Err(StatusCode::BAD_REQUEST),
        Err(RangeError::Unsatisfiable) => {
            return Ok((
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{size}"))],
            )
                .into_response());
        }
    };

    let (status, start, len) = match range {
        Some(r) => (StatusCode::PARTIAL_CONTENT, r.start, r.len),
        None => (StatusCode::OK, 0, size),
    };

    let mut response = if method == Method::HEAD || len == 0 {
        Response::new(Body::empty())
    } else {
        Response::new(stream_body(storage, path.clone(), start, len))
    };
    *response.status_mut() = status;
    let out = response.headers_mut();
    out.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type(&path)));
    out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Some(r) = range {
        if let Ok(value) = HeaderValue::from_str(&r.content_range(size)) {
            out.insert(header::CONTENT_RANGE, value);
        }
    }
    Ok(response)
}

/// Pipe a storage read into a response body.
fn stream_body(storage: Arc<dyn Storage>, path: String, start: u64, len: u64) -> Body {
    let (mut writer, reader) = tokio::io::duplex(PIPE_BUFFER);
    tokio::spawn(async move {
        match storage.get(&path, start, Some(len), &mut writer).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(path = %path, "File vanished while serving"),
            Err(e) => tracing::debug!(path = %path, "Stopped serving: {}", e),
        }
    });
    Body::from_stream(ReaderStream::new(reader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use reqwest::Client;

    async fn start() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());
        storage.init().await.unwrap();
        let mut body: &[u8] = b"0123456789";
        storage.put("ab/cd/clip.mp4", &mut body).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::new(storage));
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (dir, format!("http://{addr}/file/ab/cd/clip.mp4"))
    }

    async fn fetch(url: &str, range: Option<&str>) -> reqwest::Response {
        let mut request = Client::new().get(url);
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }
        request.send().await.unwrap()
    }

    fn header_of<'a>(resp: &'a reqwest::Response, name: header::HeaderName) -> &'a str {
        resp.headers().get(name).unwrap().to_str().unwrap()
    }

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("bytes=2-5", 10), Ok(ByteRange { start: 2, len: 4 }));
        assert_eq!(parse_range("bytes=7-", 10), Ok(ByteRange { start: 7, len: 3 }));
        assert_eq!(parse_range("bytes=-3", 10), Ok(ByteRange { start: 7, len: 3 }));
        assert_eq!(parse_range("bytes=-30", 10), Ok(ByteRange { start: 0, len: 10 }));
        assert_eq!(parse_range("bytes=8-100", 10), Ok(ByteRange { start: 8, len: 2 }));
    }

    #[test]
    fn test_parse_range_rejects() {
        assert_eq!(parse_range("bytes=0-1,4-5", 10), Err(RangeError::Invalid));
        assert_eq!(parse_range("items=0-1", 10), Err(RangeError::Invalid));
        assert_eq!(parse_range("bytes=5-2", 10), Err(RangeError::Invalid));
        assert_eq!(parse_range("bytes=a-", 10), Err(RangeError::Invalid));
        assert_eq!(parse_range("bytes=-", 10), Err(RangeError::Invalid));
        assert_eq!(parse_range("bytes=10-", 10), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=-0", 10), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=0-", 0), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn test_content_type_by_extension() {
        assert_eq!(content_type("ab/cd/x.JPG"), "image/jpeg");
        assert_eq!(content_type("ab/cd/x.mp4"), "video/mp4");
        assert_eq!(content_type("ab/cd/x"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_full_get() {
        let (_dir, url) = start().await;
        let resp = fetch(&url, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_of(&resp, header::CONTENT_TYPE), "video/mp4");
        assert_eq!(header_of(&resp, header::ACCEPT_RANGES), "bytes");
        assert_eq!(header_of(&resp, header::CONTENT_LENGTH), "10");
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"0123456789");
    }

    #[tokio::test]
    async fn test_partial_get() {
        let (_dir, url) = start().await;
        let resp = fetch(&url, Some("bytes=2-5")).await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_of(&resp, header::CONTENT_RANGE), "bytes 2-5/10");
        assert_eq!(header_of(&resp, header::CONTENT_LENGTH), "4");
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"2345");

        let resp = fetch(&url, Some("bytes=-3")).await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_of(&resp, header::CONTENT_RANGE), "bytes 7-9/10");
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"789");
    }

    #[tokio::test]
    async fn test_bad_ranges() {
        let (_dir, url) = start().await;
        let resp = fetch(&url, Some("bytes=20-")).await;
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header_of(&resp, header::CONTENT_RANGE), "bytes */10");

        let resp = fetch(&url, Some("bytes=0-1,3-4")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_head_has_headers_only() {
        let (_dir, url) = start().await;
        let resp = Client::new().head(&url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_of(&resp, header::CONTENT_LENGTH), "10");
        assert_eq!(header_of(&resp, header::ACCEPT_RANGES), "bytes");
        assert!(resp.bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_404() {
        let (_dir, url) = start().await;
        let resp = fetch(&url.replace("clip.mp4", "gone.mp4"), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

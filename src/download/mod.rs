//! Bounded download pool: a fixed set of workers drains a bounded queue of
//! [`DownloadOp`]s, streaming each response into storage while hashing it.

pub mod error;
pub mod hashing;
pub mod op;
pub mod paths;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::TryStreamExt as _;
use reqwest::Client;
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::retry::{self, RetryAction, RetryConfig, RetryError};
use crate::storage::Storage;

pub use error::{DownloadError, PoolError};
pub use hashing::HashingReader;
pub use op::DownloadOp;

/// Anything downloads can be handed to. The sync driver only needs this.
#[async_trait]
pub trait DownloadQueue: Send + Sync {
    /// Enqueue an op, waiting while the queue is full.
    async fn add(&self, op: DownloadOp) -> Result<(), PoolError>;
}

/// Outcome counts since the pool was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

struct Shared {
    client: Client,
    storage: Arc<dyn Storage>,
    retry: RetryConfig,
    counters: Counters,
}

enum PoolState {
    Stopped,
    Running {
        sender: async_channel::Sender<DownloadOp>,
        cancel: CancellationToken,
        tracker: TaskTracker,
        started: Instant,
    },
}

pub struct DownloadPool {
    shared: Arc<Shared>,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for DownloadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadPool")
            .field("storage", &self.shared.storage)
            .field("retry", &self.shared.retry)
            .finish_non_exhaustive()
    }
}

impl DownloadPool {
    pub fn new(client: Client, storage: Arc<dyn Storage>, retry: RetryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                storage,
                retry,
                counters: Counters::default(),
            }),
            state: Mutex::new(PoolState::Stopped),
        }
    }

    /// Spawn `workers` workers behind a queue holding at most `capacity` ops.
    ///
    /// Workers observe a child of `parent`, so cancelling the parent (or
    /// calling [`stop`](Self::stop)) aborts in-flight transfers.
    pub async fn start(
        &self,
        parent: &CancellationToken,
        workers: usize,
        capacity: usize,
    ) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        if matches!(*state, PoolState::Running { .. }) {
            return Err(PoolError::AlreadyRunning);
        }
        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        let cancel = parent.child_token();
        let tracker = TaskTracker::new();
        let workers = workers.max(1);
        for worker in 0..workers {
            tracker.spawn(run_worker(
                worker,
                Arc::clone(&self.shared),
                receiver.clone(),
                cancel.clone(),
            ));
        }
        tracing::debug!(workers, capacity, "Download pool started");
        *state = PoolState::Running {
            sender,
            cancel,
            tracker,
            started: Instant::now(),
        };
        Ok(())
    }

    /// Close the queue. Workers finish what is queued, then exit.
    pub async fn done(&self) {
        if let PoolState::Running { sender, .. } = &*self.state.lock().await {
            sender.close();
        }
    }

    /// Wait for every worker to exit. Call [`done`](Self::done) first or this
    /// waits until the pool is cancelled.
    pub async fn wait(&self) {
        let (tracker, started) = match &*self.state.lock().await {
            PoolState::Running {
                tracker, started, ..
            } => (tracker.clone(), *started),
            PoolState::Stopped => return,
        };
        tracker.close();
        tracker.wait().await;
        *self.state.lock().await = PoolState::Stopped;
        self.log_summary(started.elapsed());
    }

    /// Cancel in-flight work, drop whatever is still queued, and wait for
    /// the workers to exit.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, PoolState::Stopped);
        if let PoolState::Running {
            sender,
            cancel,
            tracker,
            started,
        } = previous
        {
            cancel.cancel();
            sender.close();
            tracker.close();
            tracker.wait().await;
            self.log_summary(started.elapsed());
        }
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
        }
    }

    fn log_summary(&self, elapsed: Duration) {
        let stats = self.stats();
        tracing::info!(
            "Downloads: {} completed, {} failed, {} cancelled in {}",
            stats.completed,
            stats.failed,
            stats.cancelled,
            format_duration(elapsed)
        );
    }
}

#[async_trait]
impl DownloadQueue for DownloadPool {
    async fn add(&self, op: DownloadOp) -> Result<(), PoolError> {
        let sender = match &*self.state.lock().await {
            PoolState::Running { sender, .. } => sender.clone(),
            PoolState::Stopped => return Err(PoolError::NotRunning),
        };
        sender.send(op).await.map_err(|_| PoolError::QueueClosed)
    }
}

async fn run_worker(
    worker: usize,
    shared: Arc<Shared>,
    receiver: async_channel::Receiver<DownloadOp>,
    cancel: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            op = receiver.recv() => match op {
                Ok(op) => op,
                Err(_) => break,
            },
        };
        shared.process(op, &cancel).await;
    }
    tracing::trace!(worker, "Download worker exiting");
}

impl Shared {
    async fn process(&self, op: DownloadOp, cancel: &CancellationToken) {
        let DownloadOp {
            destination,
            request,
            on_complete,
        } = op;
        tracing::debug!(url = %paths::strip_query(request.url().as_str()), path = %destination, "downloading");

        let result = retry::retry_with_backoff(
            &self.retry,
            cancel,
            |e: &DownloadError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || self.attempt(&request, &destination),
        )
        .await;

        let hash = match result {
            Ok(hash) => hash,
            Err(RetryError::Cancelled) => {
                tracing::debug!(path = %destination, "Download cancelled");
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                tracing::error!(path = %destination, "Download failed: {}", e);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if let Some(callback) = on_complete {
            if let Err(e) = callback(hash).await {
                tracing::error!(path = %destination, "Failed to record download: {:#}", e);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        tracing::debug!(path = %destination, "Downloaded");
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Single attempt: stream the body through the hasher into storage.
    async fn attempt(
        &self,
        request: &reqwest::Request,
        destination: &str,
    ) -> Result<String, DownloadError> {
        let request = request
            .try_clone()
            .ok_or_else(|| DownloadError::RequestNotCloneable(destination.to_string()))?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| DownloadError::Http {
                source: e,
                path: destination.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(DownloadError::HttpStatus {
                status: response.status().as_u16(),
                path: destination.to_string(),
            });
        }

        let expected = response.content_length();
        let body = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        let mut reader = HashingReader::new(StreamReader::new(body)).with_expected_len(expected);
        let size = match self.storage.put(destination, &mut reader).await {
            Ok(size) => size,
            Err(_) if reader.is_short() => {
                return Err(DownloadError::Truncated {
                    path: destination.to_string(),
                    expected: reader.expected_len().unwrap_or_default(),
                    received: reader.bytes_read(),
                });
            }
            Err(e) => {
                return Err(DownloadError::Storage {
                    path: destination.to_string(),
                    source: e,
                })
            }
        };
        tracing::trace!(size_bytes = size, path = %destination, "stored");
        Ok(reader.finish())
    }
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::AtomicU32;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    fn instant_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_secs: 0,
            max_delay_secs: 0,
        }
    }

    async fn pool() -> (tempfile::TempDir, Arc<LocalStorage>, DownloadPool) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path().to_path_buf()));
        storage.init().await.unwrap();
        let pool = DownloadPool::new(Client::new(), storage.clone(), instant_retry());
        (dir, storage, pool)
    }

    fn get_op(url: &str, destination: &str) -> DownloadOp {
        let request = Client::new().get(url).build().unwrap();
        DownloadOp::new(destination, request)
    }

    async fn read(storage: &LocalStorage, path: &str) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        storage.get(path, 0, None, &mut out).await.unwrap().then_some(out)
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 01m 01s");
    }

    #[tokio::test]
    async fn test_add_before_start_fails() {
        let (_dir, _storage, pool) = pool().await;
        let err = pool
            .add(get_op("http://127.0.0.1:1/x", "x"))
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::NotRunning);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_dir, _storage, pool) = pool().await;
        let token = CancellationToken::new();
        pool.start(&token, 1, 1).await.unwrap();
        assert_eq!(
            pool.start(&token, 1, 1).await.unwrap_err(),
            PoolError::AlreadyRunning
        );
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let base = serve(Router::new().route(
            "/flaky.jpg",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        (StatusCode::SERVICE_UNAVAILABLE, "busy")
                    } else {
                        (StatusCode::OK, "hello")
                    }
                }
            }),
        ))
        .await;

        let (_dir, storage, pool) = pool().await;
        let token = CancellationToken::new();
        pool.start(&token, 2, 4).await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let op = get_op(&format!("{base}/flaky.jpg"), "ab/cd/file.jpg").on_complete(
            move |hash| async move {
                let _ = tx.send(hash);
                Ok(())
            },
        );
        pool.add(op).await.unwrap();
        pool.done().await;
        pool.wait().await;

        assert_eq!(rx.await.unwrap(), HELLO_SHA256);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(read(&storage, "ab/cd/file.jpg").await.unwrap(), b"hello");
        assert_eq!(
            pool.stats(),
            PoolStats {
                completed: 1,
                failed: 0,
                cancelled: 0
            }
        );
    }

    #[tokio::test]
    async fn test_forbidden_is_not_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let base = serve(Router::new().route(
            "/secret.jpg",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::FORBIDDEN
                }
            }),
        ))
        .await;

        let (_dir, storage, pool) = pool().await;
        let token = CancellationToken::new();
        pool.start(&token, 1, 1).await.unwrap();

        let called = Arc::new(AtomicU32::new(0));
        let flag = called.clone();
        let op = get_op(&format!("{base}/secret.jpg"), "s.jpg").on_complete(move |_| async move {
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        pool.add(op).await.unwrap();
        pool.done().await;
        pool.wait().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert!(read(&storage, "s.jpg").await.is_none());
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_count_as_failed() {
        let base = serve(Router::new().route(
            "/down.jpg",
            get(|| async { StatusCode::BAD_GATEWAY }),
        ))
        .await;

        let (_dir, _storage, pool) = pool().await;
        let token = CancellationToken::new();
        pool.start(&token, 1, 1).await.unwrap();
        pool.add(get_op(&format!("{base}/down.jpg"), "d.jpg"))
            .await
            .unwrap();
        pool.done().await;
        pool.wait().await;
        assert_eq!(pool.stats().failed, 1);
        assert_eq!(pool.stats().completed, 0);
    }

    #[tokio::test]
    async fn test_short_body_is_not_stored() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Announces ten bytes, sends three, then hangs up.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\nabc")
                    .await;
                let _ = socket.shutdown().await;
            }
        });

        let (dir, storage, pool) = pool().await;
        let token = CancellationToken::new();
        pool.start(&token, 1, 1).await.unwrap();
        let called = Arc::new(AtomicU32::new(0));
        let flag = called.clone();
        let op = get_op(&format!("http://{addr}/short.jpg"), "ab/cd/short.jpg").on_complete(
            move |_| async move {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        pool.add(op).await.unwrap();
        pool.done().await;
        pool.wait().await;

        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert!(read(&storage, "ab/cd/short.jpg").await.is_none());
        assert!(!dir.path().join("ab/cd/short.jpg.wip").exists());
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_completion_error_counts_as_failed() {
        let base = serve(Router::new().route("/a.jpg", get(|| async { "hello" }))).await;

        let (_dir, storage, pool) = pool().await;
        let token = CancellationToken::new();
        pool.start(&token, 1, 1).await.unwrap();
        let op = get_op(&format!("{base}/a.jpg"), "a.jpg")
            .on_complete(|_| async { anyhow::bail!("database unavailable") });
        pool.add(op).await.unwrap();
        pool.done().await;
        pool.wait().await;

        // The file stays; only the bookkeeping failed.
        assert_eq!(read(&storage, "a.jpg").await.unwrap(), b"hello");
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_many_ops_across_workers() {
        let base = serve(Router::new().route("/f/{name}", get(|| async { "hello" }))).await;

        let (_dir, storage, pool) = pool().await;
        let token = CancellationToken::new();
        pool.start(&token, 3, 2).await.unwrap();
        for i in 0..10 {
            pool.add(get_op(&format!("{base}/f/{i}.jpg"), &format!("out/{i}.jpg")))
                .await
                .unwrap();
        }
        pool.done().await;
        pool.wait().await;

        assert_eq!(pool.stats().completed, 10);
        for i in 0..10 {
            assert_eq!(storage.stat(&format!("out/{i}.jpg")).await.unwrap(), Some(5));
        }
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight() {
        let base = serve(Router::new().route(
            "/slow.mp4",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                "late"
            }),
        ))
        .await;

        let (_dir, storage, pool) = pool().await;
        let token = CancellationToken::new();
        pool.start(&token, 1, 1).await.unwrap();
        pool.add(get_op(&format!("{base}/slow.mp4"), "slow.mp4"))
            .await
            .unwrap();
        // Let the worker pick it up.
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), pool.stop())
            .await
            .expect("stop should not wait for the slow response");
        assert_eq!(pool.stats().cancelled, 1);
        assert!(read(&storage, "slow.mp4").await.is_none());
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_workers() {
        let (_dir, _storage, pool) = pool().await;
        let token = CancellationToken::new();
        pool.start(&token, 2, 2).await.unwrap();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), pool.wait())
            .await
            .expect("workers should exit on cancellation");
    }
}

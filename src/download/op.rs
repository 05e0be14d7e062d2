use std::future::Future;

use futures_util::future::BoxFuture;

/// Callback run once the file is stored, given the hex SHA-256 of its bytes.
pub type Completion = Box<dyn FnOnce(String) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// One unit of work for the pool: fetch `request` into `destination`.
pub struct DownloadOp {
    pub destination: String,
    pub request: reqwest::Request,
    pub on_complete: Option<Completion>,
}

impl DownloadOp {
    pub fn new(destination: impl Into<String>, request: reqwest::Request) -> Self {
        Self {
            destination: destination.into(),
            request,
            on_complete: None,
        }
    }

    pub fn on_complete<F, Fut>(mut self, callback: F) -> Self
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_complete = Some(Box::new(move |hash| Box::pin(callback(hash))));
        self
    }

    pub fn url(&self) -> &str {
        self.request.url().as_str()
    }
}

impl std::fmt::Debug for DownloadOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOp")
            .field("destination", &self.destination)
            .field("url", &self.url())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

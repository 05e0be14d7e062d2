use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

/// Pass-through reader that computes the SHA-256 of everything read, so a
/// download is hashed while it streams into storage.
///
/// With an expected length set, end of input at any other length is an
/// `UnexpectedEof` error, so the storage write fails instead of committing a
/// short file.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
    expected: Option<u64>,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
            expected: None,
        }
    }

    pub fn with_expected_len(mut self, expected: Option<u64>) -> Self {
        self.expected = expected;
        self
    }

    pub fn expected_len(&self) -> Option<u64> {
        self.expected
    }

    /// Whether the input ended at a length other than the expected one.
    pub fn is_short(&self) -> bool {
        self.expected.is_some_and(|n| n != self.bytes)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Lowercase hex digest of the bytes read so far.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let wanted = buf.remaining();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let fresh = &buf.filled()[before..];
            this.hasher.update(fresh);
            this.bytes += fresh.len() as u64;
            let eof = fresh.is_empty() && wanted > 0;
            let over = this.expected.is_some_and(|n| this.bytes > n);
            if (eof && this.is_short()) || over {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "body ended at {} of {} bytes",
                        this.bytes,
                        this.expected.unwrap_or_default()
                    ),
                )));
            }
        }
        poll
    }
}

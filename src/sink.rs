//! Per-page sinks and the factory contract that produces them.
//!
//! The pipeline asks a [`SinkFactory`] for one sink per page, strictly in
//! increasing page order, and never holds two sinks open at once. Each sink
//! is written, then closed exactly once via `shutdown()`, whether the page
//! succeeded or not.
//!
//! Any closure of shape `FnMut(CancelToken, usize) -> impl Future<Output =
//! io::Result<S>>` is a factory:
//!
//! ```rust,no_run
//! use pdf_thumbnailer::{CancelToken, DEFAULT_CONFIG};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let source = tokio::fs::File::open("input.pdf").await?;
//! let ctx = CancelToken::new();
//! DEFAULT_CONFIG
//!     .render(&ctx, source, 70, |_ctx: CancelToken, page: usize| async move {
//!         tokio::fs::File::create(format!("gen-{page}.png")).await
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::cancel::CancelToken;
use crate::error::ThumbnailError;
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

/// Produces a fresh writable sink for each 1-based page number.
pub trait SinkFactory: Send {
    type Sink: AsyncWrite + Unpin + Send;

    /// Open the sink for `page`. Called once per page, in order.
    fn create(
        &mut self,
        ctx: &CancelToken,
        page: usize,
    ) -> impl Future<Output = io::Result<Self::Sink>> + Send;
}

impl<F, Fut, S> SinkFactory for F
where
    F: FnMut(CancelToken, usize) -> Fut + Send,
    Fut: Future<Output = io::Result<S>> + Send,
    S: AsyncWrite + Unpin + Send,
{
    type Sink = S;

    fn create(
        &mut self,
        ctx: &CancelToken,
        page: usize,
    ) -> impl Future<Output = io::Result<S>> + Send {
        self(ctx.clone(), page)
    }
}

// ── Directory sink ───────────────────────────────────────────────────────

/// Writes each page to `dir/<pattern>`, where `{page}` in the pattern is
/// replaced by the page number.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
    pattern: String,
}

impl DirectorySink {
    /// The pattern must contain `{page}` so pages never overwrite each other.
    pub fn new(dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Result<Self, ThumbnailError> {
        let pattern = pattern.into();
        if !pattern.contains("{page}") {
            return Err(ThumbnailError::InvalidConfig(format!(
                "file name pattern '{pattern}' must contain {{page}}"
            )));
        }
        Ok(Self {
            dir: dir.into(),
            pattern,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path the sink for `page` is written to.
    pub fn path_for(&self, page: usize) -> PathBuf {
        self.dir.join(self.pattern.replace("{page}", &page.to_string()))
    }
}

impl SinkFactory for DirectorySink {
    type Sink = tokio::fs::File;

    fn create(
        &mut self,
        _ctx: &CancelToken,
        page: usize,
    ) -> impl Future<Output = io::Result<tokio::fs::File>> + Send {
        let path = self.path_for(page);
        async move { tokio::fs::File::create(path).await }
    }
}

// ── Memory sink ──────────────────────────────────────────────────────────

/// Collects every page in memory, keyed by page number.
///
/// A page is recorded when its sink is closed, so only fully delivered
/// pages appear in [`MemorySink::pages`].
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    store: Arc<Mutex<BTreeMap<usize, Vec<u8>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Closed pages in page order.
    pub fn pages(&self) -> Vec<(usize, Vec<u8>)> {
        match self.store.lock() {
            Ok(store) => store.iter().map(|(p, b)| (*p, b.clone())).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(p, b)| (*p, b.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.store.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SinkFactory for MemorySink {
    type Sink = MemoryPage;

    fn create(
        &mut self,
        _ctx: &CancelToken,
        page: usize,
    ) -> impl Future<Output = io::Result<MemoryPage>> + Send {
        let store = Arc::clone(&self.store);
        async move {
            Ok(MemoryPage {
                page,
                buf: Vec::new(),
                store,
                closed: false,
            })
        }
    }
}

/// In-memory sink for one page; see [`MemorySink`].
#[derive(Debug)]
pub struct MemoryPage {
    page: usize,
    buf: Vec<u8>,
    store: Arc<Mutex<BTreeMap<usize, Vec<u8>>>>,
    closed: bool,
}

impl AsyncWrite for MemoryPage {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after close",
            )));
        }
        this.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.closed {
            this.closed = true;
            let bytes = std::mem::take(&mut this.buf);
            let mut store = this
                .store
                .lock()
                .map_err(|_| io::Error::other("memory sink store poisoned"))?;
            store.insert(this.page, bytes);
        }
        Poll::Ready(Ok(()))
    }
}

// ── Hashing sink ─────────────────────────────────────────────────────────

/// MD5 digests of closed pages, keyed by page number (lowercase hex).
pub type Checksums = Arc<Mutex<BTreeMap<usize, String>>>;

/// Wraps another factory and records the MD5 digest of every page it
/// delivers, for byte-for-byte comparison against known fixtures.
#[derive(Debug)]
pub struct HashingFactory<F> {
    inner: F,
    checksums: Checksums,
}

impl<F: SinkFactory> HashingFactory<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            checksums: Checksums::default(),
        }
    }

    /// Shared handle to the digests recorded so far.
    pub fn checksums(&self) -> Checksums {
        Arc::clone(&self.checksums)
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: SinkFactory> SinkFactory for HashingFactory<F> {
    type Sink = HashingSink<F::Sink>;

    fn create(
        &mut self,
        ctx: &CancelToken,
        page: usize,
    ) -> impl Future<Output = io::Result<Self::Sink>> + Send {
        let checksums = Arc::clone(&self.checksums);
        let opening = self.inner.create(ctx, page);
        async move {
            Ok(HashingSink {
                inner: opening.await?,
                hasher: md5::Context::new(),
                page,
                checksums,
            })
        }
    }
}

/// Sink wrapper computing the MD5 digest of everything written through it.
pub struct HashingSink<W> {
    inner: W,
    hasher: md5::Context,
    page: usize,
    checksums: Checksums,
}

impl<W> HashingSink<W> {
    /// Digest of the bytes written so far, as lowercase hex.
    pub fn hex_digest(&self) -> String {
        format!("{:x}", self.hasher.clone().compute())
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for HashingSink<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            this.hasher.consume(&buf[..n]);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_shutdown(cx);
        if let Poll::Ready(Ok(())) = poll {
            let digest = this.hex_digest();
            if let Ok(mut sums) = this.checksums.lock() {
                sums.insert(this.page, digest);
            }
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn directory_sink_requires_placeholder() {
        assert!(DirectorySink::new("/tmp", "thumb.png").is_err());
        let sink = DirectorySink::new("/tmp/out", "gen-{page}.png").unwrap();
        assert_eq!(sink.path_for(7), PathBuf::from("/tmp/out/gen-7.png"));
    }

    #[tokio::test]
    async fn directory_sink_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut factory = DirectorySink::new(dir.path(), "p{page}.bin").unwrap();
        let ctx = CancelToken::new();
        let mut f = factory.create(&ctx, 2).await.unwrap();
        f.write_all(b"abc").await.unwrap();
        f.shutdown().await.unwrap();
        drop(f);
        let bytes = std::fs::read(dir.path().join("p2.bin")).unwrap();
        assert_eq!(bytes, b"abc");
    }

    #[tokio::test]
    async fn memory_sink_records_on_close_only() {
        let mut factory = MemorySink::new();
        let ctx = CancelToken::new();
        let mut page = factory.create(&ctx, 1).await.unwrap();
        page.write_all(b"hello").await.unwrap();
        assert!(factory.is_empty(), "not closed yet");
        page.shutdown().await.unwrap();
        assert_eq!(factory.pages(), vec![(1, b"hello".to_vec())]);
    }

    #[tokio::test]
    async fn memory_page_rejects_write_after_close() {
        let mut factory = MemorySink::new();
        let mut page = factory.create(&CancelToken::new(), 1).await.unwrap();
        page.shutdown().await.unwrap();
        let err = page.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn hashing_factory_records_md5() {
        let mut factory = HashingFactory::new(MemorySink::new());
        let sums = factory.checksums();
        let mut page = factory.create(&CancelToken::new(), 1).await.unwrap();
        page.write_all(b"The quick brown fox jumps over the lazy dog")
            .await
            .unwrap();
        page.shutdown().await.unwrap();
        assert_eq!(
            sums.lock().unwrap().get(&1).map(String::as_str),
            Some("9e107d9d372bb6826bd81d3542a419d6")
        );
    }

    #[tokio::test]
    async fn closure_is_a_factory() {
        let mut seen = Vec::new();
        {
            let mut factory = |_ctx: CancelToken, page: usize| {
                seen.push(page);
                async move { Ok::<_, io::Error>(tokio::io::sink()) }
            };
            let ctx = CancelToken::new();
            factory.create(&ctx, 1).await.unwrap();
            factory.create(&ctx, 2).await.unwrap();
        }
        assert_eq!(seen, vec![1, 2]);
    }
}

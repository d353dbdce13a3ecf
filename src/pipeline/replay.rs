//! In-memory renderer replaying a pre-rendered page stream.
//!
//! [`ReplayRenderer`] implements [`Renderer`] without any external engine:
//! every session streams the same bytes, optionally in small reads, and ends
//! with a scripted exit. It also counts how sessions ended, which lets
//! callers assert that every path released its session.

use crate::error::ThumbnailError;
use crate::pipeline::engine;
use crate::pipeline::render::{RenderRequest, RenderSession, Renderer};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// How a replayed session ends once its output has been read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayExit {
    /// Exit status 0.
    Success,
    /// Non-zero exit with the given stderr text, diagnosed like a real engine.
    Failure { status: i32, stderr: String },
    /// The engine cannot be started at all.
    Unavailable,
    /// The output ends but the engine never exits; `finish` does not complete.
    Hang,
}

/// Session bookkeeping shared by all sessions of one renderer.
#[derive(Debug, Default)]
pub struct SessionLog {
    started: AtomicUsize,
    finished: AtomicUsize,
    aborted: AtomicUsize,
}

impl SessionLog {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Sessions neither finished nor aborted. A session whose `finish` was
    /// abandoned before completing is still live.
    pub fn live(&self) -> usize {
        self.started()
            .saturating_sub(self.finished() + self.aborted())
    }
}

/// Replays a fixed byte stream as engine output.
#[derive(Debug)]
pub struct ReplayRenderer {
    output: Arc<[u8]>,
    read_size: usize,
    stall: bool,
    exit: ReplayExit,
    log: Arc<SessionLog>,
    requests: Mutex<Vec<RenderRequest>>,
}

impl ReplayRenderer {
    /// Replay `output` (concatenated page images) and exit successfully.
    pub fn new(output: impl Into<Vec<u8>>) -> Self {
        Self {
            output: Arc::from(output.into()),
            read_size: usize::MAX,
            stall: false,
            exit: ReplayExit::Success,
            log: Arc::new(SessionLog::default()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Deliver at most `n` bytes per read.
    pub fn read_size(mut self, n: usize) -> Self {
        self.read_size = n.max(1);
        self
    }

    /// After the output is exhausted, never report EOF, like an engine
    /// that hangs.
    pub fn stall(mut self) -> Self {
        self.stall = true;
        self
    }

    pub fn exit(mut self, exit: ReplayExit) -> Self {
        self.exit = exit;
        self
    }

    pub fn sessions(&self) -> Arc<SessionLog> {
        Arc::clone(&self.log)
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<RenderRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Renderer for ReplayRenderer {
    fn name(&self) -> &str {
        "replay"
    }

    fn start<'a>(
        &'a self,
        _source: &'a Path,
        request: &'a RenderRequest,
    ) -> BoxFuture<'a, Result<Box<dyn RenderSession>, ThumbnailError>> {
        async move {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request.clone());
            }
            if self.exit == ReplayExit::Unavailable {
                return Err(ThumbnailError::EngineUnavailable {
                    engine: "replay".into(),
                    reason: "scripted as unavailable".into(),
                });
            }
            self.log.started.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ReplaySession {
                output: ReplayOutput {
                    data: Arc::clone(&self.output),
                    pos: 0,
                    read_size: self.read_size,
                    stall: self.stall,
                },
                exit: self.exit.clone(),
                log: Arc::clone(&self.log),
                released: false,
            }) as Box<dyn RenderSession>)
        }
        .boxed()
    }
}

struct ReplaySession {
    output: ReplayOutput,
    exit: ReplayExit,
    log: Arc<SessionLog>,
    released: bool,
}

impl RenderSession for ReplaySession {
    fn output(&mut self) -> &mut (dyn AsyncRead + Unpin + Send) {
        &mut self.output
    }

    fn finish(&mut self) -> BoxFuture<'_, Result<(), ThumbnailError>> {
        async move {
            if self.exit == ReplayExit::Hang {
                futures::future::pending::<()>().await;
            }
            if !self.released {
                self.released = true;
                self.log.finished.fetch_add(1, Ordering::SeqCst);
            }
            match &self.exit {
                ReplayExit::Failure { status, stderr } => Err(engine::diagnose(Some(*status), stderr)),
                _ => Ok(()),
            }
        }
        .boxed()
    }

    fn abort(self: Box<Self>) -> BoxFuture<'static, ()> {
        let released = self.released;
        let log = Arc::clone(&self.log);
        async move {
            if !released {
                log.aborted.fetch_add(1, Ordering::SeqCst);
            }
        }
        .boxed()
    }
}

struct ReplayOutput {
    data: Arc<[u8]>,
    pos: usize,
    read_size: usize,
    stall: bool,
}

impl AsyncRead for ReplayOutput {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let remaining = this.data.len() - this.pos;
        if remaining == 0 {
            // A stalled engine never wakes the reader; only cancellation
            // gets the pipeline out of here.
            return if this.stall {
                Poll::Pending
            } else {
                Poll::Ready(Ok(()))
            };
        }
        let n = remaining.min(this.read_size).min(buf.remaining());
        buf.put_slice(&this.data[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Resolution, ThumbnailerConfig};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn request() -> RenderRequest {
        RenderRequest::from_config(&ThumbnailerConfig::default(), Resolution::new(70.0))
    }

    #[tokio::test]
    async fn replays_bytes_in_small_reads() {
        let renderer = ReplayRenderer::new(b"abcdefg".to_vec()).read_size(3);
        let req = request();
        let mut session = renderer.start(Path::new("x.pdf"), &req).await.unwrap();
        let mut first = [0u8; 16];
        let n = session.output().read(&mut first).await.unwrap();
        assert_eq!(&first[..n], b"abc");
        let mut rest = Vec::new();
        session.output().read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"defg");
        session.finish().await.unwrap();
        assert_eq!(renderer.sessions().finished(), 1);
        assert_eq!(renderer.sessions().live(), 0);
    }

    #[tokio::test]
    async fn scripted_failure_is_diagnosed() {
        let renderer = ReplayRenderer::new(Vec::new()).exit(ReplayExit::Failure {
            status: 1,
            stderr: "Error: /syntaxerror in pdfopen".into(),
        });
        let req = request();
        let mut session = renderer.start(Path::new("x.pdf"), &req).await.unwrap();
        let err = session.finish().await.unwrap_err();
        assert!(matches!(err, ThumbnailError::SourceDocumentInvalid { .. }));
    }

    #[tokio::test]
    async fn unavailable_never_starts_a_session() {
        let renderer = ReplayRenderer::new(Vec::new()).exit(ReplayExit::Unavailable);
        let req = request();
        assert!(renderer.start(Path::new("x.pdf"), &req).await.is_err());
        assert_eq!(renderer.sessions().started(), 0);
        assert_eq!(renderer.requests().len(), 1);
    }

    #[tokio::test]
    async fn abort_is_counted() {
        let renderer = ReplayRenderer::new(b"xyz".to_vec()).stall();
        let req = request();
        let session = renderer.start(Path::new("x.pdf"), &req).await.unwrap();
        session.abort().await;
        assert_eq!(renderer.sessions().aborted(), 1);
        assert_eq!(renderer.sessions().live(), 0);
    }

    #[tokio::test]
    async fn abandoned_finish_leaves_the_session_live() {
        let renderer = ReplayRenderer::new(Vec::new()).exit(ReplayExit::Hang);
        let req = request();
        let mut session = renderer.start(Path::new("x.pdf"), &req).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(20), session.finish()).await;
        assert!(waited.is_err(), "a hung engine never exits");
        assert_eq!(renderer.sessions().finished(), 0);
        assert_eq!(renderer.sessions().live(), 1);

        session.abort().await;
        assert_eq!(renderer.sessions().aborted(), 1);
        assert_eq!(renderer.sessions().live(), 0);
    }

    #[tokio::test]
    async fn abort_after_finish_is_not_double_counted() {
        let renderer = ReplayRenderer::new(Vec::new());
        let req = request();
        let mut session = renderer.start(Path::new("x.pdf"), &req).await.unwrap();
        session.finish().await.unwrap();
        session.abort().await;
        assert_eq!(renderer.sessions().finished(), 1);
        assert_eq!(renderer.sessions().aborted(), 0);
    }
}

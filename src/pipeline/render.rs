//! Renderer invocation: start the engine and expose its raw page stream.
//!
//! [`Renderer`] is the seam between the pipeline and whatever rasterises the
//! document. [`GhostscriptRenderer`] runs `gs` as a child process; the
//! in-memory [`crate::pipeline::replay::ReplayRenderer`] satisfies the same
//! trait for tests and pre-rendered streams.
//!
//! A started render is a [`RenderSession`]. The session owns the engine
//! exclusively and is released by a completed [`RenderSession::finish`]
//! (engine ran to completion, check its exit) or by [`RenderSession::abort`]
//! (stop it and reap it). `finish` only borrows the session, so a wait that
//! is interrupted halfway can still be followed by `abort`. Dropping a
//! Ghostscript session without either sends a kill through `kill_on_drop`
//! but does not wait for the process to go away.

use crate::config::{OutputFormat, Resolution, ThumbnailerConfig};
use crate::error::ThumbnailError;
use crate::pipeline::engine;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, Empty};
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on captured engine stderr.
const MAX_STDERR_BYTES: u64 = 256 * 1024;

/// Engine parameters for a single render, derived from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub resolution: Resolution,
    pub format: OutputFormat,
    pub jpeg_quality: u8,
    pub text_alpha_bits: u8,
    pub graphics_alpha_bits: u8,
    pub max_pages: Option<usize>,
    pub password: Option<String>,
    pub extra_args: Vec<String>,
}

impl RenderRequest {
    pub fn from_config(config: &ThumbnailerConfig, resolution: Resolution) -> Self {
        Self {
            resolution,
            format: config.format,
            jpeg_quality: config.jpeg_quality,
            text_alpha_bits: config.text_alpha_bits,
            graphics_alpha_bits: config.graphics_alpha_bits,
            max_pages: config.max_pages,
            password: config.password.clone(),
            extra_args: config.extra_args.clone(),
        }
    }
}

/// Something that turns a PDF file into a concatenated stream of page images.
pub trait Renderer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Start rendering `source`. The returned session streams the pages.
    fn start<'a>(
        &'a self,
        source: &'a Path,
        request: &'a RenderRequest,
    ) -> BoxFuture<'a, Result<Box<dyn RenderSession>, ThumbnailError>>;
}

/// A running render, exclusively owned by one call.
pub trait RenderSession: Send {
    /// The engine's combined page output.
    fn output(&mut self) -> &mut (dyn AsyncRead + Unpin + Send);

    /// Close the output, wait for the engine to exit and translate a failed
    /// exit into an error.
    ///
    /// Cancel safe: if the returned future is dropped before it completes,
    /// the engine may still be running and the session must be aborted.
    fn finish(&mut self) -> BoxFuture<'_, Result<(), ThumbnailError>>;

    /// Terminate the engine and wait for it to be reaped.
    fn abort(self: Box<Self>) -> BoxFuture<'static, ()>;

    /// OS process id, when the session is backed by a process.
    fn process_id(&self) -> Option<u32> {
        None
    }
}

// ── Ghostscript ──────────────────────────────────────────────────────────

/// Renders through a Ghostscript child process.
#[derive(Debug, Clone, Default)]
pub struct GhostscriptRenderer {
    engine_path: Option<PathBuf>,
}

impl GhostscriptRenderer {
    /// `engine_path` overrides discovery; see [`engine::locate_engine`].
    pub fn new(engine_path: Option<PathBuf>) -> Self {
        Self { engine_path }
    }
}

impl Renderer for GhostscriptRenderer {
    fn name(&self) -> &str {
        "ghostscript"
    }

    fn start<'a>(
        &'a self,
        source: &'a Path,
        request: &'a RenderRequest,
    ) -> BoxFuture<'a, Result<Box<dyn RenderSession>, ThumbnailError>> {
        async move {
            let binary = engine::locate_engine(self.engine_path.as_deref())?;
            let args = engine::build_args(request, source);
            debug!("Spawning {} {}", binary.display(), engine::display_args(&args));

            let mut child = tokio::process::Command::new(&binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                        ThumbnailError::EngineUnavailable {
                            engine: binary.display().to_string(),
                            reason: e.to_string(),
                        }
                    }
                    _ => ThumbnailError::Io(e),
                })?;

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| ThumbnailError::Internal("engine stdout was not captured".into()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| ThumbnailError::Internal("engine stderr was not captured".into()))?;

            // Drain stderr concurrently so a chatty engine never blocks on a
            // full pipe while we are reading stdout.
            let stderr_task = tokio::spawn(async move {
                let mut stderr = stderr;
                let mut buf = Vec::new();
                let _ = (&mut stderr).take(MAX_STDERR_BYTES).read_to_end(&mut buf).await;
                // Past the cap, keep draining and discard.
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
                buf
            });

            Ok(Box::new(GhostscriptSession {
                pid: child.id(),
                child,
                stdout: Some(stdout),
                closed: tokio::io::empty(),
                stderr_task: Some(stderr_task),
            }) as Box<dyn RenderSession>)
        }
        .boxed()
    }
}

struct GhostscriptSession {
    child: Child,
    stdout: Option<ChildStdout>,
    /// Read side handed out once `stdout` has been closed.
    closed: Empty,
    stderr_task: Option<JoinHandle<Vec<u8>>>,
    pid: Option<u32>,
}

impl RenderSession for GhostscriptSession {
    fn output(&mut self) -> &mut (dyn AsyncRead + Unpin + Send) {
        match self.stdout.as_mut() {
            Some(stdout) => stdout,
            None => &mut self.closed,
        }
    }

    fn finish(&mut self) -> BoxFuture<'_, Result<(), ThumbnailError>> {
        async move {
            // An engine blocked on a full pipe gets EPIPE once our end closes.
            self.stdout = None;
            let status = self.child.wait().await?;
            let stderr = match self.stderr_task.take() {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            let stderr = String::from_utf8_lossy(&stderr);

            if status.success() {
                let tail = engine::stderr_tail(&stderr);
                if !tail.is_empty() {
                    warn!("Ghostscript reported:\n{}", tail);
                }
                debug!("Ghostscript (pid {:?}) exited cleanly", self.pid);
                Ok(())
            } else {
                debug!("Ghostscript (pid {:?}) exited with {}", self.pid, status);
                Err(engine::diagnose(status.code(), &stderr))
            }
        }
        .boxed()
    }

    fn abort(self: Box<Self>) -> BoxFuture<'static, ()> {
        let GhostscriptSession {
            mut child,
            stdout,
            stderr_task,
            pid,
            ..
        } = *self;
        async move {
            drop(stdout);
            if let Err(e) = child.start_kill() {
                debug!("Ghostscript (pid {:?}) already gone: {}", pid, e);
            }
            match child.wait().await {
                Ok(status) => debug!("Ghostscript (pid {:?}) terminated: {}", pid, status),
                Err(e) => warn!("Failed to reap Ghostscript (pid {:?}): {}", pid, e),
            }
            if let Some(task) = stderr_task {
                task.abort();
            }
        }
        .boxed()
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_copies_config_fields() {
        let config = ThumbnailerConfig::builder()
            .format(OutputFormat::PngGray)
            .max_pages(3)
            .extra_arg("-dUseCropBox")
            .build()
            .unwrap();
        let req = RenderRequest::from_config(&config, Resolution::from(96u32));
        assert_eq!(req.format, OutputFormat::PngGray);
        assert_eq!(req.max_pages, Some(3));
        assert_eq!(req.resolution, Resolution::new(96.0));
        assert_eq!(req.extra_args, vec!["-dUseCropBox".to_string()]);
    }

    #[tokio::test]
    async fn missing_engine_fails_to_start() {
        let renderer = GhostscriptRenderer::new(Some(PathBuf::from("/no/such/gs")));
        let req = RenderRequest::from_config(&ThumbnailerConfig::default(), Resolution::new(70.0));
        let err = match renderer.start(Path::new("in.pdf"), &req).await {
            Ok(_) => panic!("start should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, ThumbnailError::EngineUnavailable { .. }), "{err:?}");
    }
}

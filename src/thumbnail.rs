//! Thumbnail rendering entry points.
//!
//! All three entry points share one flow:
//!
//! ```text
//! source ──▶ resolve ──▶ engine ──▶ demux ──▶ sink per page
//! (reader,    (spool +    (gs child   (PNG/JPEG
//!  path, URL)  %PDF- check) process)   framing)
//! ```
//!
//! The call owns the engine session from start to finish. Whatever ends the
//! call (success, engine failure, sink failure, cancellation, timeout) the
//! session is either finished or aborted before the call returns.

use crate::cancel::{CancelToken, Interrupt};
use crate::config::{EmptyOutputPolicy, Resolution, ThumbnailerConfig};
use crate::error::ThumbnailError;
use crate::pipeline::demux::{demux_pages, DemuxOptions, PageInfo};
use crate::pipeline::input::{self, ResolvedSource};
use crate::pipeline::render::{GhostscriptRenderer, RenderRequest, RenderSession, Renderer};
use crate::sink::SinkFactory;
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

/// How long a failed engine gets to exit and explain itself.
const FAILURE_GRACE: Duration = Duration::from_secs(2);

/// Summary of a successful call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderStats {
    /// Number of pages delivered to sinks.
    pub page_count: usize,
    /// Sum of bytes written across all sinks.
    pub total_bytes: u64,
    /// Wall-clock time for the whole call.
    pub duration_ms: u64,
    pub pages: Vec<PageInfo>,
}

/// Render a PDF read from `source`.
///
/// The reader is spooled to a temp file first; the engine needs random
/// access. Pages are delivered to `sinks` in order, one at a time.
///
/// # Errors
/// Fails with the first error encountered. Pages delivered before the
/// failure remain with their sinks.
pub async fn render<R, F>(
    config: &ThumbnailerConfig,
    ctx: &CancelToken,
    source: R,
    resolution: impl Into<Resolution>,
    sinks: F,
) -> Result<RenderStats, ThumbnailError>
where
    R: AsyncRead + Unpin + Send,
    F: SinkFactory,
{
    let started = Instant::now();
    let resolution = resolution.into().validate()?;
    let interrupt = Interrupt::new(ctx, config.timeout);

    let resolved = interrupt.guard(input::spool_reader(source)).await?;
    run(config, &interrupt, &resolved, resolution, sinks, started).await
}

/// Render the PDF at `path`, reading it in place.
pub async fn render_file<F>(
    config: &ThumbnailerConfig,
    ctx: &CancelToken,
    path: impl AsRef<Path>,
    resolution: impl Into<Resolution>,
    sinks: F,
) -> Result<RenderStats, ThumbnailError>
where
    F: SinkFactory,
{
    let started = Instant::now();
    let resolution = resolution.into().validate()?;
    let interrupt = Interrupt::new(ctx, config.timeout);

    let resolved = interrupt.guard(input::open_local(path.as_ref())).await?;
    run(config, &interrupt, &resolved, resolution, sinks, started).await
}

/// Render a local path or an `http(s)://` URL.
///
/// URLs are downloaded with [`ThumbnailerConfig::download_timeout`]; the
/// per-call timeout still covers the whole call, download included.
pub async fn render_input<F>(
    config: &ThumbnailerConfig,
    ctx: &CancelToken,
    input: &str,
    resolution: impl Into<Resolution>,
    sinks: F,
) -> Result<RenderStats, ThumbnailError>
where
    F: SinkFactory,
{
    let started = Instant::now();
    let resolution = resolution.into().validate()?;
    let interrupt = Interrupt::new(ctx, config.timeout);

    let resolved = interrupt
        .guard(input::resolve_input(input, config.download_timeout))
        .await?;
    run(config, &interrupt, &resolved, resolution, sinks, started).await
}

async fn run<F>(
    config: &ThumbnailerConfig,
    interrupt: &Interrupt,
    source: &ResolvedSource,
    resolution: Resolution,
    mut sinks: F,
    started: Instant,
) -> Result<RenderStats, ThumbnailError>
where
    F: SinkFactory,
{
    let request = RenderRequest::from_config(config, resolution);
    let ghostscript;
    let renderer: &dyn Renderer = match &config.renderer {
        Some(r) => r.as_ref(),
        None => {
            ghostscript = GhostscriptRenderer::new(config.engine_path.clone());
            &ghostscript
        }
    };
    info!(
        "Rendering {} at {} as {} via {}",
        source.path().display(),
        resolution,
        config.format.device(),
        renderer.name()
    );

    // ── Start the engine ─────────────────────────────────────────────────
    let mut session = interrupt.guard(renderer.start(source.path(), &request)).await?;
    if let Some(pid) = session.process_id() {
        debug!("Engine session started (pid {})", pid);
    }
    if let Some(ref cb) = config.progress_callback {
        cb.on_render_start();
    }

    // ── Stream pages into sinks ──────────────────────────────────────────
    let options = DemuxOptions {
        buffer_size: config.buffer_size,
        progress: config.progress_callback.as_ref(),
    };
    let demuxed = demux_pages(
        interrupt,
        session.output(),
        config.format.framing(),
        &mut sinks,
        &options,
    )
    .await;

    let pages = match demuxed {
        Ok(pages) => pages,
        Err(e @ ThumbnailError::RenderFailed { .. }) => {
            return Err(explain_failure(interrupt, session, e).await);
        }
        Err(e) => {
            debug!("Stopping {} session: {}", renderer.name(), e);
            session.abort().await;
            return Err(e);
        }
    };

    // ── Check the engine's verdict ───────────────────────────────────────
    if let Err(e) = interrupt.guard(session.finish()).await {
        if e.is_interrupted() {
            debug!("Interrupted while waiting for {} to exit: {}", renderer.name(), e);
            session.abort().await;
        }
        return Err(e);
    }

    if pages.is_empty() {
        match config.empty_output {
            EmptyOutputPolicy::Reject => return Err(ThumbnailError::EmptyDocument),
            EmptyOutputPolicy::Allow => info!("Engine produced no pages for {}", source.path().display()),
        }
    }
    if let Some(ref cb) = config.progress_callback {
        cb.on_render_complete(pages.len());
    }

    let stats = RenderStats {
        page_count: pages.len(),
        total_bytes: pages.iter().map(|p| p.bytes).sum(),
        duration_ms: started.elapsed().as_millis() as u64,
        pages,
    };
    info!(
        "Rendered {} page(s), {} bytes in {}ms",
        stats.page_count, stats.total_bytes, stats.duration_ms
    );
    Ok(stats)
}

/// A framing failure usually means the engine stopped writing because it
/// failed. Give it a moment to exit and prefer its own diagnosis.
///
/// The grace period still yields to the call's interruption; an interrupted
/// or overdue engine is aborted before returning.
async fn explain_failure(
    interrupt: &Interrupt,
    mut session: Box<dyn RenderSession>,
    framing_error: ThumbnailError,
) -> ThumbnailError {
    let page = match &framing_error {
        ThumbnailError::RenderFailed { page, .. } => *page,
        _ => None,
    };
    let waited = tokio::select! {
        biased;
        e = interrupt.fired() => Err(e),
        r = tokio::time::timeout(FAILURE_GRACE, session.finish()) => Ok(r),
    };

    let verdict = match waited {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(_)) => {
            warn!("Engine did not exit within {:?} after a framing error", FAILURE_GRACE);
            session.abort().await;
            return framing_error;
        }
        Err(interrupted) => {
            debug!("Interrupted while waiting for a failed engine: {}", interrupted);
            session.abort().await;
            return interrupted;
        }
    };
    match verdict {
        Ok(()) => framing_error,
        Err(ThumbnailError::RenderFailed { status, detail, .. }) => ThumbnailError::RenderFailed {
            page,
            status,
            detail: format!("{} (engine: {})", failure_detail(&framing_error), detail),
        },
        Err(engine_error) => engine_error,
    }
}

fn failure_detail(e: &ThumbnailError) -> String {
    match e {
        ThumbnailError::RenderFailed { detail, .. } => detail.clone(),
        other => other.to_string(),
    }
}

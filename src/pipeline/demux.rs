//! Split the engine's concatenated output into per-page sinks.
//!
//! For every page the demultiplexer:
//!
//! 1. checks that another image starts (clean EOF here ends the document),
//! 2. asks the [`SinkFactory`] for the page's sink,
//! 3. streams the page through the structural framer into that sink,
//! 4. closes the sink, even when streaming failed.
//!
//! The first failure stops the loop. The factory is never consulted again
//! after it fails, and at most one sink is open at any time.

use crate::cancel::{CancelToken, Interrupt};
use crate::config::{Framing, OutputFormat};
use crate::error::ThumbnailError;
use crate::pipeline::framing::{self, EngineReader, PageWriter};
use crate::progress::ProgressCallback;
use crate::sink::SinkFactory;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

/// Default read buffer for engine output.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// One delivered page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    /// 1-based page number.
    pub page: usize,
    /// Bytes written to the page's sink.
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

pub(crate) struct DemuxOptions<'a> {
    pub buffer_size: usize,
    pub progress: Option<&'a ProgressCallback>,
}

impl Default for DemuxOptions<'_> {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            progress: None,
        }
    }
}

/// Demultiplex an already-rendered page stream.
///
/// `output` is what the engine writes for `format`: zero or more complete
/// images back to back. Returns the delivered pages in order.
pub async fn demux<R, F>(
    ctx: &CancelToken,
    output: &mut R,
    format: OutputFormat,
    sinks: &mut F,
) -> Result<Vec<PageInfo>, ThumbnailError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    F: SinkFactory,
{
    let interrupt = Interrupt::new(ctx, None);
    demux_pages(&interrupt, output, format.framing(), sinks, &DemuxOptions::default()).await
}

pub(crate) async fn demux_pages<R, F>(
    interrupt: &Interrupt,
    output: &mut R,
    framing: Framing,
    sinks: &mut F,
    options: &DemuxOptions<'_>,
) -> Result<Vec<PageInfo>, ThumbnailError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    F: SinkFactory,
{
    let mut reader = EngineReader::new(output, options.buffer_size);
    let mut pages: Vec<PageInfo> = Vec::new();

    loop {
        let page = pages.len() + 1;
        if reader.at_end(interrupt, page).await? {
            debug!("Engine output ended after {} page(s)", pages.len());
            return Ok(pages);
        }

        let signature = framing::read_signature(framing, &mut reader, interrupt, page).await?;

        let mut sink = interrupt
            .guard(async {
                sinks
                    .create(interrupt.token(), page)
                    .await
                    .map_err(|source| ThumbnailError::Sink { page, source })
            })
            .await?;
        if let Some(cb) = options.progress {
            cb.on_page_start(page);
        }

        let mut writer = PageWriter::new(&mut sink, page);
        let streamed = match framing::write_signature(&mut writer, interrupt, &signature).await {
            Ok(()) => framing::copy_body(framing, &mut reader, &mut writer, interrupt).await,
            Err(e) => Err(e),
        };
        let bytes = writer.written();

        // Close unconditionally; the streaming error takes precedence.
        let closed = sink.shutdown().await;
        let result = match (streamed, closed) {
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!("Closing sink for page {} after failure: {}", page, close_err);
                }
                Err(e)
            }
            (Ok(_), Err(source)) => Err(ThumbnailError::Sink { page, source }),
            (Ok(dims), Ok(())) => Ok(dims),
        };

        match result {
            Ok(dims) => {
                debug!(
                    "Page {} delivered: {} bytes{}",
                    page,
                    bytes,
                    dims.map(|(w, h)| format!(" ({w}x{h})")).unwrap_or_default()
                );
                if let Some(cb) = options.progress {
                    cb.on_page_complete(page, bytes);
                }
                pages.push(PageInfo {
                    page,
                    bytes,
                    width: dims.map(|(w, _)| w),
                    height: dims.map(|(_, h)| h),
                });
            }
            Err(e) => {
                if let Some(cb) = options.progress {
                    cb.on_page_error(page, &e.to_string());
                }
                return Err(e);
            }
        }
    }
}

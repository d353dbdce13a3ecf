//! Error types for the pdf-thumbnailer library.
//!
//! Every call returns at most one [`ThumbnailError`]. There is no partial
//! result: pages delivered before the failure stay delivered to their sinks,
//! and the caller decides whether to roll them back.
//!
//! The variants fall into five groups:
//!
//! * engine problems ([`ThumbnailError::EngineUnavailable`],
//!   [`ThumbnailError::RenderFailed`])
//! * source problems ([`ThumbnailError::SourceNotFound`],
//!   [`ThumbnailError::SourceDocumentInvalid`], download failures)
//! * sink problems ([`ThumbnailError::Sink`])
//! * interruption ([`ThumbnailError::Cancelled`], [`ThumbnailError::Timeout`])
//! * caller mistakes ([`ThumbnailError::InvalidResolution`],
//!   [`ThumbnailError::InvalidConfig`])

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ThumbnailError> = std::result::Result<T, E>;

/// All errors returned by the pdf-thumbnailer library.
#[derive(Debug, Error)]
pub enum ThumbnailError {
    // ── Engine errors ─────────────────────────────────────────────────────
    /// The rendering engine could not be located or started.
    #[error(
        "Ghostscript engine '{engine}' is unavailable: {reason}\n\
Install Ghostscript (apt install ghostscript / brew install ghostscript)\n\
or set PDFTHUMB_GS_PATH=/path/to/gs."
    )]
    EngineUnavailable { engine: String, reason: String },

    /// The engine ran but exited abnormally or produced an incomplete page.
    #[error("Rendering failed{}: {detail}", page_suffix(*page))]
    RenderFailed {
        /// Page in flight when the failure was detected, if any.
        page: Option<usize>,
        /// Engine exit code, when the engine has exited.
        status: Option<i32>,
        detail: String,
    },

    // ── Source errors ─────────────────────────────────────────────────────
    /// The source file does not exist or cannot be opened.
    #[error("Source document not found: '{path}' ({reason})")]
    SourceNotFound { path: PathBuf, reason: String },

    /// The source is not a PDF, or the engine rejected it as malformed.
    #[error("Source document is invalid: {detail}")]
    SourceDocumentInvalid { detail: String },

    /// The engine produced zero pages and the empty-output policy rejects that.
    #[error("Source document produced no pages")]
    EmptyDocument,

    /// An HTTP source could not be downloaded.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// An HTTP download exceeded its timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Sink errors ───────────────────────────────────────────────────────
    /// The sink factory or a sink write/close failed for `page`.
    #[error("Sink for page {page} failed: {source}")]
    Sink {
        page: usize,
        #[source]
        source: std::io::Error,
    },

    // ── Interruption ──────────────────────────────────────────────────────
    /// The cancellation context fired before the call completed.
    #[error("Rendering cancelled")]
    Cancelled,

    /// The configured per-call timeout expired.
    #[error("Rendering timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    // ── Caller errors ─────────────────────────────────────────────────────
    /// Resolution must be a finite, positive number of dots per inch.
    #[error("Invalid resolution {0}: must be a positive DPI value")]
    InvalidResolution(f32),

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Local I/O failure unrelated to a sink (spooling, engine pipes).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn page_suffix(page: Option<usize>) -> String {
    match page {
        Some(p) => format!(" on page {p}"),
        None => String::new(),
    }
}

impl ThumbnailError {
    /// Shorthand for a [`ThumbnailError::RenderFailed`] without exit status.
    pub(crate) fn render_failed(page: Option<usize>, detail: impl Into<String>) -> Self {
        ThumbnailError::RenderFailed {
            page,
            status: None,
            detail: detail.into(),
        }
    }

    /// True for errors caused by interruption rather than a fault.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ThumbnailError::Cancelled | ThumbnailError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_failed_display_with_page() {
        let e = ThumbnailError::RenderFailed {
            page: Some(3),
            status: Some(1),
            detail: "truncated PNG".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("on page 3"), "got: {msg}");
        assert!(msg.contains("truncated PNG"));
    }

    #[test]
    fn render_failed_display_without_page() {
        let e = ThumbnailError::render_failed(None, "exit 1");
        assert_eq!(e.to_string(), "Rendering failed: exit 1");
    }

    #[test]
    fn sink_error_keeps_source() {
        use std::error::Error as _;
        let e = ThumbnailError::Sink {
            page: 2,
            source: std::io::Error::other("disk full"),
        };
        assert!(e.to_string().contains("page 2"));
        assert_eq!(e.source().map(|s| s.to_string()).as_deref(), Some("disk full"));
    }

    #[test]
    fn interrupted_classification() {
        assert!(ThumbnailError::Cancelled.is_interrupted());
        assert!(ThumbnailError::Timeout { elapsed_ms: 5000 }.is_interrupted());
        assert!(!ThumbnailError::EmptyDocument.is_interrupted());
    }

    #[test]
    fn engine_unavailable_mentions_env_override() {
        let e = ThumbnailError::EngineUnavailable {
            engine: "gs".into(),
            reason: "not found".into(),
        };
        assert!(e.to_string().contains("PDFTHUMB_GS_PATH"));
    }
}

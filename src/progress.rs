//! Progress-callback trait for per-page rendering events.
//!
//! Inject an [`Arc<dyn ThumbnailProgressCallback>`] via
//! [`crate::config::ThumbnailerConfigBuilder::progress_callback`] to observe
//! the pipeline as it delivers each page. Events arrive on the task driving
//! the call, in page order, never concurrently for the same call.
//!
//! The engine streams pages without announcing a total up front, so no
//! event carries a page count until [`on_render_complete`].
//!
//! [`on_render_complete`]: ThumbnailProgressCallback::on_render_complete
//!
//! # Example
//!
//! ```rust
//! use pdf_thumbnailer::{ThumbnailProgressCallback, ThumbnailerConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct ByteCounter(AtomicUsize);
//!
//! impl ThumbnailProgressCallback for ByteCounter {
//!     fn on_page_complete(&self, _page: usize, bytes: u64) {
//!         self.0.fetch_add(bytes as usize, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = ThumbnailerConfig::builder()
//!     .progress_callback(Arc::new(ByteCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it renders and delivers pages.
///
/// All methods default to no-ops so implementors override only what they
/// need. Implementations must be `Send + Sync` because a configuration may
/// be shared across concurrent calls.
pub trait ThumbnailProgressCallback: Send + Sync {
    /// Called once, after the engine has started.
    fn on_render_start(&self) {}

    /// Called after the sink for `page` has been opened.
    fn on_page_start(&self, page: usize) {
        let _ = page;
    }

    /// Called after the sink for `page` has been closed successfully.
    ///
    /// # Arguments
    /// * `page`: 1-indexed page number
    /// * `bytes`: encoded image size delivered to the sink
    fn on_page_complete(&self, page: usize, bytes: u64) {
        let _ = (page, bytes);
    }

    /// Called when the call fails while `page` is in flight.
    fn on_page_error(&self, page: usize, error: &str) {
        let _ = (page, error);
    }

    /// Called once after the engine exited cleanly.
    fn on_render_complete(&self, total_pages: usize) {
        let _ = total_pages;
    }
}

/// A no-op implementation; the default when no callback is configured.
pub struct NoopProgressCallback;

impl ThumbnailProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ThumbnailerConfig`].
pub type ProgressCallback = Arc<dyn ThumbnailProgressCallback>;

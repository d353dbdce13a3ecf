//! # pdf-thumbnailer
//!
//! Stream per-page thumbnails of a PDF into caller-supplied sinks.
//!
//! ## How it works
//!
//! Ghostscript renders the whole document in one process and writes every
//! page image to its stdout back to back. This crate reads that stream,
//! finds each page boundary from the image format's own structure, and
//! copies each page into a fresh sink obtained from a [`SinkFactory`], in
//! page order, without ever holding a whole page in memory.
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Source  spool reader / open path / download URL, check %PDF-
//!  ├─ 2. Engine  gs -sDEVICE=png16m -r70 -sOutputFile=- (child process)
//!  ├─ 3. Demux   PNG chunks / JPEG markers → page boundaries
//!  └─ 4. Sinks   factory(ctx, page) → write → close, one page at a time
//! ```
//!
//! Every step honours a [`CancelToken`] and the optional per-call timeout.
//! Whatever ends a call, the engine process is gone when it returns.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf_thumbnailer::{CancelToken, DirectorySink, DEFAULT_CONFIG};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = CancelToken::new();
//!     let source = tokio::fs::File::open("document.pdf").await?;
//!     let sinks = DirectorySink::new("thumbs", "gen-{page}.png")?;
//!     let stats = DEFAULT_CONFIG.render(&ctx, source, 70, sinks).await?;
//!     eprintln!("{} pages, {} bytes", stats.page_count, stats.total_bytes);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfthumb` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdf-thumbnailer = { version = "0.1", default-features = false }
//! ```
//!
//! ## Engine discovery
//!
//! The engine binary comes from [`ThumbnailerConfig::engine_path`], else the
//! `PDFTHUMB_GS_PATH` environment variable, else `gs` (or `gswin64c` on
//! Windows) on `PATH`. [`check_engine`] reports what would be used.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cancel;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod sink;
pub mod thumbnail;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cancel::CancelToken;
pub use config::{
    EmptyOutputPolicy, Framing, OutputFormat, Resolution, ThumbnailerConfig, ThumbnailerConfigBuilder,
    DEFAULT_CONFIG,
};
pub use error::{Result, ThumbnailError};
pub use pipeline::demux::{demux, PageInfo};
pub use pipeline::engine::{check_engine, EngineInfo};
pub use pipeline::render::{GhostscriptRenderer, RenderRequest, RenderSession, Renderer};
pub use pipeline::replay::{ReplayExit, ReplayRenderer, SessionLog};
pub use progress::{NoopProgressCallback, ProgressCallback, ThumbnailProgressCallback};
pub use sink::{Checksums, DirectorySink, HashingFactory, HashingSink, MemoryPage, MemorySink, SinkFactory};
pub use thumbnail::{render, render_file, render_input, RenderStats};

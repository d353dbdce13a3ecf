//! Pipeline stages for PDF thumbnail rendering.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ demux ──▶ sinks
//! (reader/    (engine    (framing)
//!  path/URL)   session)
//! ```
//!
//! 1. [`input`]: spool or open the source and check it is a PDF
//! 2. [`render`]: start the engine; [`engine`] builds its command line,
//!    finds the binary, and diagnoses failed exits
//! 3. [`demux`]: cut the engine's output into pages using [`framing`]
//!    and hand each page to its sink
//!
//! [`replay`] provides an engine-free [`render::Renderer`] that replays a
//! pre-rendered stream.

pub mod demux;
pub mod engine;
pub(crate) mod framing;
pub mod input;
pub mod render;
pub mod replay;

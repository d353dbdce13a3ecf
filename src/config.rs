//! Configuration types for thumbnail rendering.
//!
//! All engine-invocation defaults live in [`ThumbnailerConfig`], built via
//! its [`ThumbnailerConfigBuilder`]. A configuration is immutable once
//! built; share it freely across concurrent calls. [`DEFAULT_CONFIG`] is the
//! preconfigured instance for callers that need no customisation.

use crate::cancel::CancelToken;
use crate::error::ThumbnailError;
use crate::pipeline::render::Renderer;
use crate::progress::ProgressCallback;
use crate::sink::SinkFactory;
use crate::thumbnail::RenderStats;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Process-wide default configuration: 24-bit PNG, 4-bit anti-aliasing,
/// `gs` resolved from `PDFTHUMB_GS_PATH` or `PATH`.
pub static DEFAULT_CONFIG: Lazy<ThumbnailerConfig> = Lazy::new(ThumbnailerConfig::default);

/// Configuration for a thumbnail rendering call.
///
/// # Example
/// ```rust
/// use pdf_thumbnailer::{OutputFormat, ThumbnailerConfig};
///
/// let config = ThumbnailerConfig::builder()
///     .format(OutputFormat::Jpeg)
///     .jpeg_quality(70)
///     .max_pages(1)
///     .build()
///     .unwrap();
/// assert_eq!(config.format.extension(), "jpg");
/// ```
#[derive(Clone)]
pub struct ThumbnailerConfig {
    /// Raster format produced by the engine. Default: [`OutputFormat::Png16m`].
    pub format: OutputFormat,

    /// JPEG quality (1–100) for the JPEG formats. Default: 85.
    pub jpeg_quality: u8,

    /// Anti-aliasing bits for text (1, 2 or 4). Default: 4.
    ///
    /// Thumbnails are small; without anti-aliasing text turns into noise
    /// below roughly 100 DPI.
    pub text_alpha_bits: u8,

    /// Anti-aliasing bits for vector graphics (1, 2 or 4). Default: 4.
    pub graphics_alpha_bits: u8,

    /// Explicit path to the Ghostscript executable. If `None`, the engine is
    /// looked up via `PDFTHUMB_GS_PATH` and then `PATH`.
    pub engine_path: Option<PathBuf>,

    /// Additional raw engine arguments appended before the input file.
    pub extra_args: Vec<String>,

    /// Render at most this many pages, starting at page 1. Default: all.
    pub max_pages: Option<usize>,

    /// Password for encrypted documents.
    ///
    /// Ghostscript only takes it on the command line (`-sPDFPassword=`), so
    /// while the engine runs the password is readable by other local users
    /// through the process table (`ps`, `/proc/<pid>/cmdline`). Logs mask it.
    /// Do not rely on it for secrets on shared hosts.
    pub password: Option<String>,

    /// Per-call timeout. Default: none.
    pub timeout: Option<Duration>,

    /// HTTP timeout for URL sources given to [`crate::render_input`].
    /// Default: 120 s.
    pub download_timeout: Duration,

    /// What to do when the engine produces no pages. Default: allow.
    pub empty_output: EmptyOutputPolicy,

    /// Copy buffer size in bytes between engine and sink. Default: 64 KiB.
    pub buffer_size: usize,

    /// Pre-constructed renderer. Takes precedence over the Ghostscript
    /// engine settings above.
    pub renderer: Option<Arc<dyn Renderer>>,

    /// Optional per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ThumbnailerConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            jpeg_quality: 85,
            text_alpha_bits: 4,
            graphics_alpha_bits: 4,
            engine_path: None,
            extra_args: Vec::new(),
            max_pages: None,
            password: None,
            timeout: None,
            download_timeout: Duration::from_secs(120),
            empty_output: EmptyOutputPolicy::default(),
            buffer_size: 64 * 1024,
            renderer: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ThumbnailerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailerConfig")
            .field("format", &self.format)
            .field("jpeg_quality", &self.jpeg_quality)
            .field("text_alpha_bits", &self.text_alpha_bits)
            .field("graphics_alpha_bits", &self.graphics_alpha_bits)
            .field("engine_path", &self.engine_path)
            .field("extra_args", &self.extra_args)
            .field("max_pages", &self.max_pages)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("download_timeout", &self.download_timeout)
            .field("empty_output", &self.empty_output)
            .field("buffer_size", &self.buffer_size)
            .field("renderer", &self.renderer.as_ref().map(|_| "<dyn Renderer>"))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ThumbnailProgressCallback>"),
            )
            .finish()
    }
}

impl ThumbnailerConfig {
    /// Create a new builder for `ThumbnailerConfig`.
    pub fn builder() -> ThumbnailerConfigBuilder {
        ThumbnailerConfigBuilder {
            config: Self::default(),
        }
    }

    /// Render `source` at `resolution`, delivering each page to a sink
    /// obtained from `sinks`, honouring `ctx`.
    ///
    /// See [`crate::thumbnail::render`].
    pub async fn render<R, F>(
        &self,
        ctx: &CancelToken,
        source: R,
        resolution: impl Into<Resolution>,
        sinks: F,
    ) -> Result<RenderStats, ThumbnailError>
    where
        R: AsyncRead + Unpin + Send,
        F: SinkFactory,
    {
        crate::thumbnail::render(self, ctx, source, resolution, sinks).await
    }
}

/// Builder for [`ThumbnailerConfig`].
pub struct ThumbnailerConfigBuilder {
    config: ThumbnailerConfig,
}

impl fmt::Debug for ThumbnailerConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailerConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ThumbnailerConfigBuilder {
    pub fn format(mut self, format: OutputFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q;
        self
    }

    pub fn text_alpha_bits(mut self, bits: u8) -> Self {
        self.config.text_alpha_bits = bits;
        self
    }

    pub fn graphics_alpha_bits(mut self, bits: u8) -> Self {
        self.config.graphics_alpha_bits = bits;
        self
    }

    pub fn engine_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.engine_path = Some(path.into());
        self
    }

    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.extra_args.push(arg.into());
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = Some(n);
        self
    }

    /// See [`ThumbnailerConfig::password`] for how the password is exposed.
    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_timeout = timeout;
        self
    }

    pub fn empty_output(mut self, policy: EmptyOutputPolicy) -> Self {
        self.config.empty_output = policy;
        self
    }

    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.config.buffer_size = bytes;
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.config.renderer = Some(renderer);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ThumbnailerConfig, ThumbnailError> {
        let c = &self.config;
        if !(1..=100).contains(&c.jpeg_quality) {
            return Err(ThumbnailError::InvalidConfig(format!(
                "JPEG quality must be 1–100, got {}",
                c.jpeg_quality
            )));
        }
        for (name, bits) in [
            ("text_alpha_bits", c.text_alpha_bits),
            ("graphics_alpha_bits", c.graphics_alpha_bits),
        ] {
            if !matches!(bits, 1 | 2 | 4) {
                return Err(ThumbnailError::InvalidConfig(format!(
                    "{name} must be 1, 2 or 4, got {bits}"
                )));
            }
        }
        if c.max_pages == Some(0) {
            return Err(ThumbnailError::InvalidConfig("max_pages must be ≥ 1".into()));
        }
        if c.buffer_size < 512 {
            return Err(ThumbnailError::InvalidConfig(format!(
                "buffer_size must be ≥ 512 bytes, got {}",
                c.buffer_size
            )));
        }
        if c.timeout == Some(Duration::ZERO) {
            return Err(ThumbnailError::InvalidConfig("timeout must be non-zero".into()));
        }
        Ok(self.config)
    }
}

// ── Value types ──────────────────────────────────────────────────────────

/// Raster format requested from the engine.
///
/// The variant determines both the Ghostscript device and how the
/// demultiplexer finds page boundaries in the engine's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// 24-bit RGB PNG (default).
    #[default]
    Png16m,
    /// 32-bit RGBA PNG with transparent background.
    PngAlpha,
    /// 8-bit grayscale PNG.
    PngGray,
    /// 8-bit palette PNG.
    Png256,
    /// 24-bit RGB JPEG.
    Jpeg,
    /// 8-bit grayscale JPEG.
    JpegGray,
}

/// How page boundaries are recognised in a concatenated output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Png,
    Jpeg,
}

impl OutputFormat {
    /// Ghostscript `-sDEVICE=` name.
    pub fn device(self) -> &'static str {
        match self {
            OutputFormat::Png16m => "png16m",
            OutputFormat::PngAlpha => "pngalpha",
            OutputFormat::PngGray => "pnggray",
            OutputFormat::Png256 => "png256",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::JpegGray => "jpeggray",
        }
    }

    /// Conventional file extension.
    pub fn extension(self) -> &'static str {
        match self.framing() {
            Framing::Png => "png",
            Framing::Jpeg => "jpg",
        }
    }

    /// MIME type of each page.
    pub fn mime_type(self) -> &'static str {
        match self.framing() {
            Framing::Png => "image/png",
            Framing::Jpeg => "image/jpeg",
        }
    }

    pub fn framing(self) -> Framing {
        match self {
            OutputFormat::Png16m
            | OutputFormat::PngAlpha
            | OutputFormat::PngGray
            | OutputFormat::Png256 => Framing::Png,
            OutputFormat::Jpeg | OutputFormat::JpegGray => Framing::Jpeg,
        }
    }

    /// Parse a device name as accepted by the CLI (`png16m`, `jpeg`, …).
    pub fn from_device(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "png" | "png16m" => OutputFormat::Png16m,
            "pngalpha" => OutputFormat::PngAlpha,
            "pnggray" => OutputFormat::PngGray,
            "png256" => OutputFormat::Png256,
            "jpeg" | "jpg" => OutputFormat::Jpeg,
            "jpeggray" => OutputFormat::JpegGray,
            _ => return None,
        })
    }
}

/// Policy for an engine run that yields zero pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EmptyOutputPolicy {
    /// Return success with zero sink invocations (default).
    #[default]
    Allow,
    /// Fail with [`ThumbnailError::EmptyDocument`].
    Reject,
}

/// Rendering resolution in dots per inch, optionally anisotropic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub x: f32,
    pub y: f32,
}

impl Resolution {
    /// Same DPI on both axes.
    pub fn new(dpi: f32) -> Self {
        Self { x: dpi, y: dpi }
    }

    /// Different horizontal and vertical DPI.
    pub fn xy(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Reject zero, negative and non-finite values.
    pub fn validate(self) -> Result<Self, ThumbnailError> {
        for v in [self.x, self.y] {
            if !v.is_finite() || v <= 0.0 {
                return Err(ThumbnailError::InvalidResolution(v));
            }
        }
        Ok(self)
    }

    /// Ghostscript `-r` argument value: `70` or `70x96`.
    pub fn engine_value(&self) -> String {
        if self.x == self.y {
            format!("{}", self.x)
        } else {
            format!("{}x{}", self.x, self.y)
        }
    }
}

impl From<u32> for Resolution {
    fn from(dpi: u32) -> Self {
        Self::new(dpi as f32)
    }
}

/// Lets integer literals like `70` be passed directly. Negative values are
/// rejected by [`Resolution::validate`].
impl From<i32> for Resolution {
    fn from(dpi: i32) -> Self {
        Self::new(dpi as f32)
    }
}

impl From<f32> for Resolution {
    fn from(dpi: f32) -> Self {
        Self::new(dpi)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dpi", self.engine_value())
    }
}

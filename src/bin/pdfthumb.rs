//! CLI binary for pdf-thumbnailer.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ThumbnailerConfig`, writes one file per page, and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pdf_thumbnailer::{
    check_engine, render_input, CancelToken, DirectorySink, HashingFactory, OutputFormat, ProgressCallback,
    RenderStats, ThumbnailError, ThumbnailProgressCallback, ThumbnailerConfig,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner plus one log line per page. The page count is not known until the
/// engine stops writing, so there is no bar length.
struct CliProgressCallback {
    bar: ProgressBar,
    delivered: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.set_message("Reading PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            delivered: AtomicUsize::new(0),
        })
    }
}

impl ThumbnailProgressCallback for CliProgressCallback {
    fn on_render_start(&self) {
        self.bar.set_prefix("Rendering");
        self.bar.set_message("waiting for page 1");
    }

    fn on_page_start(&self, page: usize) {
        self.bar.set_message(format!("page {page}"));
    }

    fn on_page_complete(&self, page: usize, bytes: u64) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} Page {:>4}  {}",
            green("✓"),
            page,
            dim(&format!("{bytes:>8} bytes")),
        ));
    }

    fn on_page_error(&self, page: usize, error: &str) {
        let msg = if error.len() > 80 {
            let cut = (0..=79).rev().find(|&i| error.is_char_boundary(i)).unwrap_or(0);
            format!("{}\u{2026}", &error[..cut])
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} Page {:>4}  {}", red("✗"), page, red(&msg)));
    }

    fn on_render_complete(&self, total_pages: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} pages rendered",
            green("✔"),
            bold(&total_pages.to_string())
        );
    }
}

impl Drop for CliProgressCallback {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Thumbnails of every page at 70 DPI into ./
  pdfthumb document.pdf

  # JPEG thumbnails of the first 3 pages into thumbs/
  pdfthumb --format jpeg --max-pages 3 -o thumbs document.pdf

  # Custom file names and checksums
  pdfthumb --pattern 'gen-{page}.png' --md5 document.pdf

  # From a URL, with a 30 second limit
  pdfthumb --timeout 30 https://example.com/paper.pdf

  # Which Ghostscript would be used?
  pdfthumb --engine-info

ENVIRONMENT VARIABLES:
  PDFTHUMB_GS_PATH   Path to the Ghostscript executable
  RUST_LOG           Log filter (overrides -v / -q)

Press Ctrl-C to cancel: the engine is stopped and the page being written
is closed.
"#;

/// Render PDF pages to thumbnail images with Ghostscript.
#[derive(Parser, Debug)]
#[command(
    name = "pdfthumb",
    version,
    about = "Render PDF pages to PNG or JPEG thumbnails with Ghostscript",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    #[arg(required_unless_present = "engine_info")]
    input: Option<String>,

    /// Directory the page images are written to.
    #[arg(short, long = "output-dir", env = "PDFTHUMB_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Rendering resolution in DPI.
    #[arg(long, env = "PDFTHUMB_DPI", default_value_t = 70,
          value_parser = clap::value_parser!(u32).range(1..=2400))]
    dpi: u32,

    /// Image format.
    #[arg(long, env = "PDFTHUMB_FORMAT", value_enum, default_value = "png16m")]
    format: FormatArg,

    /// File name pattern; `{page}` is replaced by the page number.
    /// Default: page-{page}.png (or .jpg).
    #[arg(long)]
    pattern: Option<String>,

    /// Render at most this many pages.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    max_pages: Option<u64>,

    /// JPEG quality (1-100).
    #[arg(long, default_value_t = 85, value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: u8,

    /// PDF user password for encrypted documents. Prefer PDFTHUMB_PASSWORD
    /// over the flag; the engine still receives it on its command line.
    #[arg(long, env = "PDFTHUMB_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Give up after this many seconds.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: Option<u64>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDFTHUMB_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print the MD5 digest of every page.
    #[arg(long)]
    md5: bool,

    /// Output structured JSON instead of a file list.
    #[arg(long)]
    json: bool,

    /// Disable progress display.
    #[arg(long, env = "PDFTHUMB_NO_PROGRESS")]
    no_progress: bool,

    /// Ghostscript executable to use.
    #[arg(long)]
    engine: Option<PathBuf>,

    /// Print the Ghostscript that would be used, then exit.
    #[arg(long)]
    engine_info: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFTHUMB_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFTHUMB_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Png16m,
    Pngalpha,
    Pnggray,
    Png256,
    Jpeg,
    Jpeggray,
}

impl From<FormatArg> for OutputFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Png16m => OutputFormat::Png16m,
            FormatArg::Pngalpha => OutputFormat::PngAlpha,
            FormatArg::Pnggray => OutputFormat::PngGray,
            FormatArg::Png256 => OutputFormat::Png256,
            FormatArg::Jpeg => OutputFormat::Jpeg,
            FormatArg::Jpeggray => OutputFormat::JpegGray,
        }
    }
}

/// `--json` document.
#[derive(Serialize)]
struct Report<'a> {
    input: &'a str,
    output_dir: &'a std::path::Path,
    files: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    md5: Option<BTreeMap<usize, String>>,
    stats: &'a RenderStats,
}

/// Exit status for a call interrupted with Ctrl-C.
const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress display is active.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    // ── Engine info mode ─────────────────────────────────────────────────
    if cli.engine_info {
        let info = check_engine(cli.engine.as_deref())
            .await
            .context("Ghostscript check failed")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&info).context("Failed to serialise engine info")?
            );
        } else {
            println!("Engine:   {}", info.path.display());
            println!("Version:  {}", info.version);
        }
        return Ok(());
    }

    let input = cli
        .input
        .as_deref()
        .context("An input PDF path or URL is required")?;

    // ── Cancellation ─────────────────────────────────────────────────────
    let token = CancelToken::new();
    {
        let token = token.clone();
        let quiet = cli.quiet;
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                if !quiet {
                    eprintln!("{} cancelling…", red("✗"));
                }
                token.cancel();
            }
        });
    }

    // ── Build config and sinks ───────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as ProgressCallback)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    tokio::fs::create_dir_all(&cli.output_dir)
        .await
        .with_context(|| format!("Failed to create output directory {}", cli.output_dir.display()))?;
    let pattern = cli
        .pattern
        .clone()
        .unwrap_or_else(|| format!("page-{{page}}.{}", config.format.extension()));
    let sinks = DirectorySink::new(&cli.output_dir, pattern).context("Invalid --pattern")?;
    let paths = sinks.clone();

    // ── Run ──────────────────────────────────────────────────────────────
    let (result, checksums) = if cli.md5 {
        let hashing = HashingFactory::new(sinks);
        let sums = hashing.checksums();
        let result = render_input(&config, &token, input, cli.dpi, hashing).await;
        (result, Some(sums))
    } else {
        (render_input(&config, &token, input, cli.dpi, sinks).await, None)
    };

    let stats = match result {
        Ok(stats) => stats,
        Err(ThumbnailError::Cancelled) => {
            if !cli.quiet {
                eprintln!("{} cancelled", red("✗"));
            }
            std::process::exit(EXIT_CANCELLED);
        }
        Err(e) => return Err(e).context("Thumbnail rendering failed"),
    };

    let md5: Option<BTreeMap<usize, String>> = checksums
        .map(|sums| sums.lock().map(|m| m.clone()).unwrap_or_default());
    let files: Vec<PathBuf> = stats.pages.iter().map(|p| paths.path_for(p.page)).collect();

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        let report = Report {
            input,
            output_dir: &cli.output_dir,
            files,
            md5,
            stats: &stats,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise output")?
        );
        return Ok(());
    }

    for (info, file) in stats.pages.iter().zip(&files) {
        match md5.as_ref().and_then(|m| m.get(&info.page)) {
            // md5sum-compatible line
            Some(digest) => println!("{}  {}", digest, file.display()),
            None => println!("{}", file.display()),
        }
    }

    if !cli.quiet && !show_progress {
        eprintln!(
            "Rendered {} pages ({} bytes) in {}ms",
            stats.page_count, stats.total_bytes, stats.duration_ms
        );
    }

    Ok(())
}

/// Map CLI args to `ThumbnailerConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ThumbnailerConfig> {
    let mut builder = ThumbnailerConfig::builder()
        .format(cli.format.into())
        .jpeg_quality(cli.jpeg_quality)
        .download_timeout(Duration::from_secs(cli.download_timeout));

    if let Some(n) = cli.max_pages {
        builder = builder.max_pages(usize::try_from(n).context("--max-pages is too large")?);
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(secs) = cli.timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    if let Some(ref engine) = cli.engine {
        builder = builder.engine_path(engine.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

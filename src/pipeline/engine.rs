//! Ghostscript discovery, argument construction and exit diagnosis.
//!
//! The engine is located in this order (first match wins):
//!
//! 1. an explicit path from [`crate::ThumbnailerConfig::engine_path`]
//! 2. the `PDFTHUMB_GS_PATH` environment variable
//! 3. `gs`, `gswin64c` or `gswin32c` on `PATH`
//!
//! Ghostscript reports everything through its exit code and free-form
//! stderr text. [`diagnose`] turns that pair into the crate's error
//! taxonomy: input-related failures become
//! [`ThumbnailError::SourceDocumentInvalid`], everything else
//! [`ThumbnailError::RenderFailed`].

use crate::error::ThumbnailError;
use crate::pipeline::render::RenderRequest;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Environment variable overriding the engine location.
pub const ENGINE_PATH_ENV: &str = "PDFTHUMB_GS_PATH";

const ENGINE_NAMES: &[&str] = &["gs", "gswin64c", "gswin32c"];

/// Number of trailing stderr lines carried in error messages.
const STDERR_TAIL_LINES: usize = 12;

static INVALID_SOURCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(undefinedfilename|syntaxerror|/undefined in|/ioerror|couldn't find trailer|startxref|not a valid pdf|requires a password|password did not work|invalidfileaccess)",
    )
    .unwrap()
});

static VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").unwrap());

/// Identity of a usable engine binary.
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub path: PathBuf,
    pub version: String,
    pub major: u32,
    pub minor: u32,
}

fn engine_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    let mut push_candidate = |path: PathBuf| {
        if seen.insert(path.clone()) {
            candidates.push(path);
        }
    };

    // A bare name ("gs") in the override is searched on PATH below.
    let explicit_name = explicit.and_then(|p| {
        if p.components().count() == 1 {
            p.to_str().map(str::to_string)
        } else {
            push_candidate(p.to_path_buf());
            None
        }
    });

    if explicit.is_none() {
        if let Some(value) = env::var_os(ENGINE_PATH_ENV).filter(|v| !v.is_empty()) {
            push_candidate(PathBuf::from(value));
        }
    }

    let names: Vec<String> = match explicit_name {
        Some(name) => vec![name],
        None if explicit.is_some() => Vec::new(),
        None => ENGINE_NAMES.iter().map(|s| s.to_string()).collect(),
    };

    if let Some(path_env) = env::var_os("PATH") {
        for dir in env::split_paths(&path_env) {
            for name in &names {
                push_candidate(dir.join(name));
                if cfg!(target_os = "windows") {
                    push_candidate(dir.join(format!("{name}.exe")));
                }
            }
        }
    }

    candidates
}

/// Resolve the engine binary without running it.
pub fn locate_engine(explicit: Option<&Path>) -> Result<PathBuf, ThumbnailError> {
    for candidate in engine_candidates(explicit) {
        if candidate.is_file() {
            debug!("Using Ghostscript at {}", candidate.display());
            return Ok(candidate);
        }
    }

    Err(ThumbnailError::EngineUnavailable {
        engine: explicit
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "gs".to_string()),
        reason: "executable not found".to_string(),
    })
}

/// Locate the engine and confirm it runs by asking for its version.
pub async fn check_engine(explicit: Option<&Path>) -> Result<EngineInfo, ThumbnailError> {
    let path = locate_engine(explicit)?;
    let unavailable = |reason: String| ThumbnailError::EngineUnavailable {
        engine: path.display().to_string(),
        reason,
    };

    let output = Command::new(&path)
        .arg("--version")
        .output()
        .await
        .map_err(|e| unavailable(e.to_string()))?;

    if !output.status.success() {
        return Err(unavailable(format!(
            "'--version' exited with {}",
            output.status
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let (version, major, minor) =
        parse_version(&text).ok_or_else(|| unavailable(format!("unrecognised version '{}'", text.trim())))?;

    Ok(EngineInfo {
        path,
        version,
        major,
        minor,
    })
}

/// Parse `gs --version` output such as `10.02.1`.
pub fn parse_version(text: &str) -> Option<(String, u32, u32)> {
    let caps = VERSION.captures(text.trim())?;
    let major = caps.get(1)?.as_str().parse().ok()?;
    let minor = caps.get(2)?.as_str().parse().ok()?;
    Some((caps.get(0)?.as_str().to_string(), major, minor))
}

/// Build the full Ghostscript argument list for one render.
///
/// Output always goes to stdout (`-sOutputFile=-`) as a concatenation of
/// complete page images; engine chatter is redirected to stderr so it can
/// never corrupt the image stream.
pub fn build_args(request: &RenderRequest, source: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-q",
        "-dSAFER",
        "-dBATCH",
        "-dNOPAUSE",
        "-dNOPROMPT",
        "-sstdout=%stderr",
    ]
    .iter()
    .map(OsString::from)
    .collect();

    args.push(format!("-sDEVICE={}", request.format.device()).into());
    args.push(format!("-r{}", request.resolution.engine_value()).into());
    args.push(format!("-dTextAlphaBits={}", request.text_alpha_bits).into());
    args.push(format!("-dGraphicsAlphaBits={}", request.graphics_alpha_bits).into());

    if request.format.framing() == crate::config::Framing::Jpeg {
        args.push(format!("-dJPEGQ={}", request.jpeg_quality).into());
    }
    if let Some(n) = request.max_pages {
        args.push("-dFirstPage=1".into());
        args.push(format!("-dLastPage={n}").into());
    }
    if let Some(ref pwd) = request.password {
        args.push(format!("-sPDFPassword={pwd}").into());
    }
    args.extend(request.extra_args.iter().map(OsString::from));

    args.push("-sOutputFile=-".into());
    args.push("-f".into());
    args.push(source.as_os_str().to_os_string());
    args
}

/// Argument list for logging, with the document password masked.
pub fn display_args(args: &[OsString]) -> String {
    args.iter()
        .map(|a| {
            let a = a.to_string_lossy();
            if a.starts_with("-sPDFPassword=") {
                "-sPDFPassword=***".to_string()
            } else {
                a.into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Last few non-empty lines of engine stderr.
pub fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Map a non-zero engine exit to an error.
pub fn diagnose(status: Option<i32>, stderr: &str) -> ThumbnailError {
    let tail = stderr_tail(stderr);
    if INVALID_SOURCE.is_match(stderr) {
        return ThumbnailError::SourceDocumentInvalid {
            detail: if tail.is_empty() {
                "rejected by Ghostscript".to_string()
            } else {
                tail
            },
        };
    }

    let detail = match (status, tail.is_empty()) {
        (Some(code), true) => format!("Ghostscript exited with status {code}"),
        (Some(code), false) => format!("Ghostscript exited with status {code}:\n{tail}"),
        (None, true) => "Ghostscript was terminated by a signal".to_string(),
        (None, false) => format!("Ghostscript was terminated by a signal:\n{tail}"),
    };
    ThumbnailError::RenderFailed {
        page: None,
        status,
        detail,
    }
}

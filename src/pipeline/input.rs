//! Source resolution: turn a reader, path, or URL into a file the engine can open.
//!
//! Ghostscript wants a seekable file, not a pipe, so caller-supplied readers
//! and downloads are spooled into a [`NamedTempFile`]. The temp file lives as
//! long as the [`ResolvedSource`], which the pipeline holds until the engine
//! has exited. Every source is checked for the `%PDF-` header before the
//! engine ever sees it.

use crate::error::ThumbnailError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

const PDF_MAGIC: &[u8] = b"%PDF-";

/// How far into the file the header may start. Some producers prepend junk.
const MAGIC_WINDOW: usize = 1024;

/// A PDF the engine can open by path.
#[derive(Debug)]
pub enum ResolvedSource {
    /// Caller's own file, used in place.
    Local(PathBuf),
    /// Spooled copy of a reader or download, removed on drop.
    Spooled { path: PathBuf, _file: NamedTempFile },
}

impl ResolvedSource {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedSource::Local(p) => p,
            ResolvedSource::Spooled { path, .. } => path,
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a CLI-style input: a URL is downloaded, anything else is a path.
pub async fn resolve_input(input: &str, download_timeout: Duration) -> Result<ResolvedSource, ThumbnailError> {
    if is_url(input) {
        download_url(input, download_timeout).await
    } else {
        open_local(Path::new(input)).await
    }
}

fn check_magic(head: &[u8], what: &str) -> Result<(), ThumbnailError> {
    if head.is_empty() {
        return Err(ThumbnailError::SourceDocumentInvalid {
            detail: format!("{what} is empty"),
        });
    }
    let window = &head[..head.len().min(MAGIC_WINDOW)];
    if window.windows(PDF_MAGIC.len()).any(|w| w == PDF_MAGIC) {
        Ok(())
    } else {
        let shown: String = window
            .iter()
            .take(8)
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        Err(ThumbnailError::SourceDocumentInvalid {
            detail: format!("{what} is not a PDF (starts with '{shown}')"),
        })
    }
}

async fn read_head(file: &mut tokio::fs::File) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(MAGIC_WINDOW);
    file.take(MAGIC_WINDOW as u64).read_to_end(&mut head).await?;
    Ok(head)
}

/// Validate an existing file and use it in place.
pub async fn open_local(path: &Path) -> Result<ResolvedSource, ThumbnailError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            let reason = match e.kind() {
                std::io::ErrorKind::PermissionDenied => "permission denied".to_string(),
                std::io::ErrorKind::NotFound => "no such file".to_string(),
                _ => e.to_string(),
            };
            return Err(ThumbnailError::SourceNotFound {
                path: path.to_path_buf(),
                reason,
            });
        }
    };
    if file.metadata().await?.is_dir() {
        return Err(ThumbnailError::SourceNotFound {
            path: path.to_path_buf(),
            reason: "is a directory".into(),
        });
    }

    let head = read_head(&mut file).await?;
    check_magic(&head, &format!("'{}'", path.display()))?;

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedSource::Local(path.to_path_buf()))
}

fn spool_file() -> Result<NamedTempFile, ThumbnailError> {
    tempfile::Builder::new()
        .prefix("pdfthumb-")
        .suffix(".pdf")
        .tempfile()
        .map_err(ThumbnailError::Io)
}

/// Copy `reader` into a temp file and validate it.
pub async fn spool_reader<R>(reader: R) -> Result<ResolvedSource, ThumbnailError>
where
    R: AsyncRead + Unpin,
{
    let tmp = spool_file()?;
    let mut out = tokio::fs::File::from_std(tmp.reopen()?);
    let mut reader = reader;
    let copied = tokio::io::copy(&mut reader, &mut out).await?;
    out.flush().await?;
    drop(out);

    let mut check = tokio::fs::File::open(tmp.path()).await?;
    let head = read_head(&mut check).await?;
    check_magic(&head, "source stream")?;

    debug!("Spooled {} bytes to {}", copied, tmp.path().display());
    Ok(ResolvedSource::Spooled {
        path: tmp.path().to_path_buf(),
        _file: tmp,
    })
}

/// Download a URL into a temp file, streaming the body.
pub async fn download_url(url: &str, timeout: Duration) -> Result<ResolvedSource, ThumbnailError> {
    info!("Downloading PDF from: {}", url);

    let failed = |reason: String| ThumbnailError::DownloadFailed {
        url: url.to_string(),
        reason,
    };
    let classify = |e: reqwest::Error| {
        if e.is_timeout() {
            ThumbnailError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout.as_secs(),
            }
        } else {
            ThumbnailError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let mut response = client.get(url).send().await.map_err(classify)?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let tmp = spool_file()?;
    let mut out = tokio::fs::File::from_std(tmp.reopen()?);
    let mut head: Vec<u8> = Vec::with_capacity(MAGIC_WINDOW);
    let mut total: u64 = 0;
    while let Some(chunk) = response.chunk().await.map_err(classify)? {
        if head.len() < MAGIC_WINDOW {
            let take = (MAGIC_WINDOW - head.len()).min(chunk.len());
            head.extend_from_slice(&chunk[..take]);
        }
        out.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    out.flush().await?;
    drop(out);

    check_magic(&head, &format!("download from '{url}'"))?;

    info!("Downloaded {} bytes to {}", total, tmp.path().display());
    Ok(ResolvedSource::Spooled {
        path: tmp.path().to_path_buf(),
        _file: tmp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn magic_may_follow_leading_junk() {
        assert!(check_magic(b"%PDF-1.7\n", "x").is_ok());
        assert!(check_magic(b"\r\n\r\n%PDF-1.4", "x").is_ok());
        let err = check_magic(b"<html>", "x").unwrap_err();
        assert!(err.to_string().contains("<html>"), "{err}");
        assert!(matches!(
            check_magic(b"", "x"),
            Err(ThumbnailError::SourceDocumentInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn spooled_reader_lives_until_dropped() {
        let data: &[u8] = b"%PDF-1.4\n1 0 obj\n<<>>\nendobj\n%%EOF\n";
        let source = spool_reader(data).await.unwrap();
        let path = source.path().to_path_buf();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
        drop(source);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn spooling_rejects_non_pdf() {
        let err = spool_reader(&b"PK\x03\x04 zip archive"[..]).await.unwrap_err();
        assert!(matches!(err, ThumbnailError::SourceDocumentInvalid { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn missing_local_file_is_not_found() {
        let err = open_local(Path::new("/definitely/not/here.pdf")).await.unwrap_err();
        assert!(matches!(err, ThumbnailError::SourceNotFound { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn local_file_is_used_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        tokio::fs::write(&path, b"%PDF-1.5\n%%EOF\n").await.unwrap();
        let source = open_local(&path).await.unwrap();
        assert!(matches!(source, ResolvedSource::Local(_)));
        assert_eq!(source.path(), path);
    }
}

//! Upload input: turn a user-supplied path or URL into a local PDF file.
//!
//! URLs are downloaded into a `TempDir` owned by [`PdfSource`], so the file
//! disappears once rasterisation is done. Both paths check the `%PDF` magic
//! bytes before pdfium ever sees the file.

use crate::error::FlipbookError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// A PDF on local disk, possibly backed by a temporary download.
pub enum PdfSource {
    Local(PathBuf),
    /// The `TempDir` lives as long as this value.
    Downloaded { path: PathBuf, _dir: TempDir },
}

impl PdfSource {
    pub fn path(&self) -> &Path {
        match self {
            PdfSource::Local(p) => p,
            PdfSource::Downloaded { path, .. } => path,
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` to a readable PDF on disk.
pub async fn resolve_pdf(input: &str, timeout_secs: u64) -> Result<PdfSource, FlipbookError> {
    if input.trim().is_empty() {
        return Err(FlipbookError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        download_pdf(input, timeout_secs).await
    } else {
        open_local(Path::new(input))
    }
}

/// `Err(NotAPdf)` unless `head` starts with `%PDF`. Short buffers pass; pdfium
/// reports them as corrupt later.
fn check_magic(path: &Path, head: &[u8]) -> Result<(), FlipbookError> {
    match head.get(..4) {
        Some(magic) if magic != PDF_MAGIC => {
            let mut found = [0u8; 4];
            found.copy_from_slice(magic);
            Err(FlipbookError::NotAPdf {
                path: path.to_path_buf(),
                magic: found,
            })
        }
        _ => Ok(()),
    }
}

fn open_local(path: &Path) -> Result<PdfSource, FlipbookError> {
    let mut file = std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => FlipbookError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => FlipbookError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;

    let mut head = Vec::with_capacity(4);
    file.by_ref()
        .take(4)
        .read_to_end(&mut head)
        .map_err(|e| FlipbookError::CorruptPdf {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    check_magic(path, &head)?;

    debug!("Using local PDF {}", path.display());
    Ok(PdfSource::Local(path.to_path_buf()))
}

async fn download_pdf(url: &str, timeout_secs: u64) -> Result<PdfSource, FlipbookError> {
    info!("Downloading PDF from {}", url);
    let failed = |reason: String| FlipbookError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            FlipbookError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }
    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    let dir = TempDir::new().map_err(|e| FlipbookError::Internal(format!("temp dir: {e}")))?;
    let path = dir.path().join(filename_from_url(url));
    check_magic(&path, &bytes)?;
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| FlipbookError::OutputWriteFailed {
            path: path.clone(),
            source: e,
        })?;

    info!("Downloaded {} bytes to {}", bytes.len(), path.display());
    Ok(PdfSource::Downloaded { path, _dir: dir })
}

/// Last path segment of the URL when it looks like a file name.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_detection() {
        assert!(is_url("https://example.com/book.pdf"));
        assert!(is_url("http://example.com/book.pdf"));
        assert!(!is_url("/tmp/book.pdf"));
        assert!(!is_url("book.pdf"));
    }

    #[tokio::test]
    async fn empty_input_is_invalid() {
        let err = resolve_pdf("  ", 5).await.err().unwrap();
        assert!(matches!(err, FlipbookError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = resolve_pdf("/definitely/not/here.pdf", 5).await.err().unwrap();
        assert!(matches!(err, FlipbookError::FileNotFound { .. }));
    }

    #[test]
    fn non_pdf_is_rejected_by_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover.png");
        std::fs::write(&path, b"\x89PNG\r\n").unwrap();
        match open_local(&path) {
            Err(FlipbookError::NotAPdf { magic, .. }) => assert_eq!(&magic, b"\x89PNG"),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("accepted a PNG"),
        }
    }

    #[test]
    fn pdf_magic_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.pdf");
        std::fs::write(&path, b"%PDF-1.7\n").unwrap();
        let source = open_local(&path).ok().unwrap();
        assert_eq!(source.path(), path.as_path());
    }

    #[test]
    fn filename_from_url_path() {
        assert_eq!(filename_from_url("https://example.com/books/dino.pdf"), "dino.pdf");
        assert_eq!(
            filename_from_url("https://example.com/download?id=3"),
            "downloaded.pdf"
        );
    }
}

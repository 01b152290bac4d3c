//! Auto-download of finished artifacts.
//!
//! When a sink is configured, the engine hands every successfully generated
//! artifact to it exactly once. A sink failure is logged by the engine and
//! never rolls back the artifact's `complete` status; the stored record simply
//! stays un-downloaded.

use crate::client::InlineImage;
use crate::error::FlipbookError;
use crate::model::ArtifactKey;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// What the sink gets alongside the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMeta {
    pub key: ArtifactKey,
    /// Target file name (`cover.jpg`, `3-spread.jpg`, `spread-2-3.mp4`, …).
    pub filename: String,
}

/// Receives each finished artifact.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn deliver(&self, url: &str, meta: &ArtifactMeta) -> Result<(), FlipbookError>;
}

/// Convenience alias for the shared sink handle.
pub type SinkHandle = Arc<dyn ArtifactSink>;

/// Accepts every artifact and keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl ArtifactSink for NoopSink {
    async fn deliver(&self, _url: &str, _meta: &ArtifactMeta) -> Result<(), FlipbookError> {
        Ok(())
    }
}

/// Writes artifacts into a directory under their canonical file names.
///
/// `data:` URIs are decoded in-process; `http(s)` URLs are fetched. Files are
/// written to a `.part` sibling and renamed into place.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
    http: reqwest::Client,
    timeout_secs: u64,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>, timeout_secs: u64) -> Result<Self, FlipbookError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| FlipbookError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            dir: dir.into(),
            http,
            timeout_secs,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FlipbookError> {
        if let Some(inline) = InlineImage::from_data_uri(url) {
            return inline.decode().map_err(|e| FlipbookError::DownloadFailed {
                url: truncate(url),
                reason: format!("bad base64 payload: {e}"),
            });
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(FlipbookError::InvalidInput { input: truncate(url) });
        }

        let response = self.http.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FlipbookError::DownloadTimeout {
                    url: url.to_string(),
                    secs: self.timeout_secs,
                }
            } else {
                FlipbookError::DownloadFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        if !response.status().is_success() {
            return Err(FlipbookError::DownloadFailed {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FlipbookError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn deliver(&self, url: &str, meta: &ArtifactMeta) -> Result<(), FlipbookError> {
        let bytes = self.fetch(url).await?;
        let path = self.dir.join(&meta.filename);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| FlipbookError::OutputWriteFailed {
                path: self.dir.clone(),
                source: e,
            })?;
        let tmp_path = path.with_extension("part");
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| FlipbookError::OutputWriteFailed {
                path: tmp_path.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| FlipbookError::OutputWriteFailed {
                path: path.clone(),
                source: e,
            })?;

        info!("Saved {} → {} ({} bytes)", meta.key, path.display(), bytes.len());
        Ok(())
    }
}

/// Data URIs are megabytes long; keep error messages readable.
fn truncate(url: &str) -> String {
    const MAX: usize = 64;
    match url.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &url[..idx]),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageKey, VideoKey};

    fn meta(key: ArtifactKey) -> ArtifactMeta {
        ArtifactMeta {
            key,
            filename: key.filename(),
        }
    }

    #[tokio::test]
    async fn noop_sink_accepts_anything() {
        let sink: SinkHandle = Arc::new(NoopSink);
        tokio_test::assert_ok!(
            sink.deliver("not even a url", &meta(ArtifactKey::Video(VideoKey::Flip(3))))
                .await
        );
        tokio_test::assert_ok!(
            sink.deliver("", &meta(ArtifactKey::Image(ImageKey::Cover)))
                .await
        );
    }

    #[tokio::test]
    async fn writes_decoded_data_uri() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("out"), 5).unwrap();
        let url = InlineImage::from_bytes("image/jpeg", b"jpeg-bytes").to_data_uri();
        sink.deliver(&url, &meta(ArtifactKey::Image(ImageKey::Spread(2))))
            .await
            .unwrap();

        let written = std::fs::read(dir.path().join("out/2-spread.jpg")).unwrap();
        assert_eq!(written, b"jpeg-bytes");
        assert!(!dir.path().join("out/2-spread.part").exists());
    }

    #[tokio::test]
    async fn rejects_unsupported_url() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path(), 5).unwrap();
        let err = sink
            .deliver("ftp://example.com/a.mp4", &meta(ArtifactKey::Video(VideoKey::Opening)))
            .await
            .unwrap_err();
        assert!(matches!(err, FlipbookError::InvalidInput { .. }));
        assert!(!dir.path().join("opening.mp4").exists());
    }

    #[test]
    fn long_urls_are_truncated() {
        let long = format!("data:image/png;base64,{}", "A".repeat(500));
        let t = truncate(&long);
        assert!(t.chars().count() <= 65);
        assert!(t.ends_with('…'));
        assert_eq!(truncate("short"), "short");
    }
}

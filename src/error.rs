//! Error types for the pdf2flipbook library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`FlipbookError`]: **fatal** for the operation that returned it: bad
//!   input file, unreadable store, a blocking generation stage that failed
//!   (cover, first spread, opening video), or a single regeneration that
//!   failed. Returned as `Err(FlipbookError)` from the public API.
//!
//! * [`GenerationError`]: one provider call for one artifact went wrong.
//!   It is classified as permanent or transient so the retry policy knows
//!   whether another attempt can help.
//!
//! * [`AttemptError`]: a [`GenerationError`] plus the number of attempts the
//!   retry policy spent before giving up. Fan-out items that fail end up
//!   here and are visible only through the progress tracker.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf2flipbook library.
#[derive(Debug, Error)]
pub enum FlipbookError {
    // ── Upload errors ─────────────────────────────────────────────────────
    /// No file at the uploaded path.
    #[error("No PDF at '{path}'")]
    FileNotFound { path: PathBuf },

    #[error("Cannot read '{path}': permission denied")]
    PermissionDenied { path: PathBuf },

    /// Neither an existing path nor an http(s) URL.
    #[error("'{input}' is neither a PDF path nor an HTTP(S) URL")]
    InvalidInput { input: String },

    /// Fetching a remote PDF or artifact failed.
    #[error("Download of '{url}' failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Download of '{url}' took longer than {secs}s (see --download-timeout)")]
    DownloadTimeout { url: String, secs: u64 },

    /// Magic bytes are not `%PDF`.
    #[error("'{path}' is not a PDF (starts with {magic:?})")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Document errors ───────────────────────────────────────────────────
    /// pdfium could not parse the document.
    #[error("PDF '{path}' cannot be opened: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    #[error("PDF '{path}' is password protected (see --password)")]
    PasswordRequired { path: PathBuf },

    #[error("Password rejected for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// One page could not be rendered or JPEG-encoded.
    #[error("Page {page} could not be rasterised: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// The document has no pages at all.
    #[error("PDF '{path}' contains no pages")]
    EmptyDocument { path: PathBuf },

    // ── Orchestration errors ──────────────────────────────────────────────
    /// A string could not be parsed as an artifact key.
    #[error("Invalid artifact key '{key}'\nExpected cover, spread-<n>, opening or spread-<n>-<n+1>.")]
    InvalidKey { key: String },

    /// The key is well-formed but not part of the current run.
    #[error("Artifact '{key}' is not part of the current {run} run")]
    UnknownKey { key: String, run: String },

    /// The progress state machine rejected a status change.
    #[error("Illegal status change for '{key}': {from} → {to}")]
    InvalidTransition {
        key: String,
        from: String,
        to: String,
    },

    /// A blocking stage, or a single regeneration, failed.
    ///
    /// For bulk runs this halts every later stage.
    #[error("Generation of '{key}' failed: {source}")]
    StageFailed {
        key: String,
        #[source]
        source: AttemptError,
    },

    // ── Storage errors ────────────────────────────────────────────────────
    /// Reading or writing the artifact store failed.
    #[error("Artifact store '{store}' error: {detail}")]
    Store { store: String, detail: String },

    /// Could not create or write a downloaded artifact.
    #[error("Cannot write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Rejected by [`GenerationConfigBuilder::build`](crate::config::GenerationConfigBuilder::build).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failed provider call for one artifact.
///
/// Stored in [`AttemptError`] so the tracker, the logs and the caller all see
/// the same classification.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GenerationError {
    /// Credentials or other required settings are missing.
    #[error("{provider} is not configured: {detail}")]
    Configuration { provider: String, detail: String },

    /// Auth failure, quota exhaustion or malformed input. Never retried.
    #[error("{provider} rejected the request: {message}")]
    Permanent {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    /// Network error, 5xx, unexpected response. Retried.
    #[error("{provider} request failed: {message}")]
    Transient {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    /// A page or reference image the request needs is absent.
    #[error("'{key}' cannot be generated: {missing} not found")]
    DependencyMissing { key: String, missing: String },

    /// The video job did not reach a terminal status in time.
    #[error("Video job {job_id} timed out after {polls} status polls")]
    Timeout { job_id: String, polls: u32 },
}

impl GenerationError {
    /// Build an error from a provider message, classifying it by content.
    ///
    /// Uses [`crate::retry::is_permanent_message`], so anything mentioning
    /// `401`, `403`, an API key, quota, invalid input or missing
    /// configuration becomes [`GenerationError::Permanent`].
    pub fn from_message(
        provider: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        let provider = provider.into();
        let message = message.into();
        if crate::retry::is_permanent_message(&message) {
            GenerationError::Permanent {
                provider,
                status,
                message,
            }
        } else {
            GenerationError::Transient {
                provider,
                status,
                message,
            }
        }
    }

    /// Whether another attempt could possibly succeed.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, GenerationError::Transient { .. })
    }
}

/// A [`GenerationError`] annotated with the attempts spent on it.
///
/// `attempts == 0` means no provider call was made (the request could not
/// even be assembled, e.g. a missing reference image).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct AttemptError {
    pub attempts: u32,
    #[source]
    pub error: GenerationError,
}

impl AttemptError {
    /// An error raised before any provider call.
    pub fn before_call(error: GenerationError) -> Self {
        Self { attempts: 0, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_message_classifies_auth_as_permanent() {
        let e = GenerationError::from_message("replicate", Some(401), "401 - Unauthenticated");
        assert!(matches!(e, GenerationError::Permanent { .. }));
        assert!(e.is_permanent());
    }

    #[test]
    fn from_message_classifies_server_error_as_transient() {
        let e = GenerationError::from_message("gemini", Some(503), "503 - overloaded");
        assert!(matches!(e, GenerationError::Transient { status: Some(503), .. }));
        assert!(!e.is_permanent());
    }

    #[test]
    fn timeout_and_dependency_are_not_retryable() {
        let t = GenerationError::Timeout {
            job_id: "abc".into(),
            polls: 180,
        };
        let d = GenerationError::DependencyMissing {
            key: "spread-2".into(),
            missing: "page 2-left".into(),
        };
        assert!(t.is_permanent());
        assert!(d.is_permanent());
    }

    #[test]
    fn attempt_error_display_keeps_count() {
        let e = AttemptError {
            attempts: 3,
            error: GenerationError::from_message("replicate", None, "connection reset"),
        };
        let msg = e.to_string();
        assert!(msg.contains("after 3 attempt"), "got: {msg}");
        assert!(msg.contains("connection reset"), "got: {msg}");
    }

    #[test]
    fn stage_failed_display() {
        let e = FlipbookError::StageFailed {
            key: "cover".into(),
            source: AttemptError::before_call(GenerationError::DependencyMissing {
                key: "cover".into(),
                missing: "page Cover Page".into(),
            }),
        };
        let msg = e.to_string();
        assert!(msg.contains("'cover'"), "got: {msg}");
        assert!(msg.contains("Cover Page"), "got: {msg}");
    }

    #[test]
    fn invalid_transition_display() {
        let e = FlipbookError::InvalidTransition {
            key: "spread-2".into(),
            from: "complete".into(),
            to: "complete".into(),
        };
        assert!(e.to_string().contains("spread-2"));
    }
}

//! Generation clients: one stateless adapter per external provider.
//!
//! The engine only talks to the two traits defined here, which keeps every
//! orchestration test free of network I/O:
//!
//! * [`ImageProvider`]: a single request/response call that returns the
//!   finished image as a URL (normally a `data:` URI).
//! * [`VideoProvider`]: an asynchronous job API. [`generate_video`] creates
//!   the job and polls it on a [`PollSchedule`] until it reaches a terminal
//!   status or the poll ceiling.
//!
//! Concrete HTTP adapters live in [`image`] (Gemini `generateContent`) and
//! [`video`] (Replicate predictions). Both classify failures into
//! [`GenerationError`] so the retry policy can tell permanent from transient.

pub mod image;
pub mod video;

pub use image::GeminiImageProvider;
pub use video::ReplicateVideoProvider;

use crate::config::PollSchedule;
use crate::error::GenerationError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::sleep;
use tracing::{debug, info};

// ── Images ───────────────────────────────────────────────────────────────

/// Base64 image payload sent inline with a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineImage {
    pub mime_type: String,
    /// Base64, no `data:` prefix.
    pub data: String,
}

impl InlineImage {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: STANDARD.encode(bytes),
        }
    }

    /// Parse `data:<mime>;base64,<data>`. `None` for anything else,
    /// including remote URLs.
    pub fn from_data_uri(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("data:")?;
        let (mime_type, data) = rest.split_once(";base64,")?;
        if mime_type.is_empty() || data.is_empty() {
            return None;
        }
        Some(Self {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        })
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    /// Decoded bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}

/// One image-generation call: prompt text followed by zero or more images,
/// sent in this order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub prompt: String,
    pub images: Vec<InlineImage>,
}

/// A provider that turns a prompt plus inline images into one image.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Short provider name for logs and errors.
    fn name(&self) -> &str;

    /// Returns the generated image URL (`data:` URI or remote URL).
    async fn generate(&self, request: &ImageRequest) -> Result<String, GenerationError>;
}

// ── Videos ───────────────────────────────────────────────────────────────

/// One transition clip job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRequest {
    pub prompt: String,
    /// First frame, as a URL the provider can read (data URIs accepted).
    pub first_frame: String,
    /// Last frame.
    pub last_frame: String,
    /// Clip length in seconds.
    pub duration: u32,
}

/// Status of an asynchronous video job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Queued,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Starting => "starting",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A job status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub status: JobStatus,
    /// Result URL, present once `succeeded`.
    pub output: Option<String>,
    pub error: Option<String>,
    pub logs: Option<String>,
}

/// A provider that renders a clip between two frames as an async job.
#[async_trait]
pub trait VideoProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Submit the job and return its id.
    async fn create(&self, request: &VideoRequest) -> Result<String, GenerationError>;

    /// Fetch the job's current status.
    async fn poll(&self, job_id: &str) -> Result<JobReport, GenerationError>;
}

/// A finished clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedVideo {
    pub job_id: String,
    pub url: String,
}

/// Create a job and poll it until it is terminal or `schedule.max_polls`
/// status checks have been made.
///
/// Reaching the ceiling yields [`GenerationError::Timeout`].
pub async fn generate_video(
    provider: &dyn VideoProvider,
    request: &VideoRequest,
    schedule: &PollSchedule,
) -> Result<FinishedVideo, GenerationError> {
    let job_id = provider.create(request).await?;
    info!("{}: video job {} created", provider.name(), job_id);

    for poll in 0..schedule.max_polls {
        let report = provider.poll(&job_id).await?;
        match report.status {
            JobStatus::Succeeded => {
                return match report.output {
                    Some(url) => {
                        info!("{}: video job {} succeeded", provider.name(), job_id);
                        Ok(FinishedVideo { job_id, url })
                    }
                    None => Err(GenerationError::Transient {
                        provider: provider.name().to_string(),
                        status: None,
                        message: format!("job {job_id} succeeded without a usable output"),
                    }),
                };
            }
            JobStatus::Failed | JobStatus::Canceled => {
                let reason = report.error.as_deref().unwrap_or("Unknown error");
                return Err(GenerationError::from_message(
                    provider.name(),
                    None,
                    format!("Video generation {}: {}", report.status, reason),
                ));
            }
            _ => {
                if let Some(line) = report.logs.as_deref().and_then(|l| l.lines().last()) {
                    debug!("{}: job {} [{}] {}", provider.name(), job_id, report.status, line);
                }
                sleep(schedule.interval_after(poll)).await;
            }
        }
    }

    Err(GenerationError::Timeout {
        job_id,
        polls: schedule.max_polls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::{Duration, Instant};

    struct ScriptedJob {
        reports: Mutex<Vec<JobReport>>,
        polls: AtomicU32,
    }

    impl ScriptedJob {
        fn new(mut reports: Vec<JobReport>) -> Self {
            reports.reverse();
            Self {
                reports: Mutex::new(reports),
                polls: AtomicU32::new(0),
            }
        }
    }

    fn report(status: JobStatus) -> JobReport {
        JobReport {
            status,
            output: None,
            error: None,
            logs: None,
        }
    }

    #[async_trait]
    impl VideoProvider for ScriptedJob {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn create(&self, _request: &VideoRequest) -> Result<String, GenerationError> {
            Ok("job-1".into())
        }

        async fn poll(&self, _job_id: &str) -> Result<JobReport, GenerationError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut reports = self.reports.lock().unwrap();
            // The last scripted report repeats forever.
            Ok(if reports.len() > 1 {
                reports.pop().unwrap()
            } else {
                reports[0].clone()
            })
        }
    }

    fn request() -> VideoRequest {
        VideoRequest {
            prompt: "flip".into(),
            first_frame: "data:image/png;base64,AA==".into(),
            last_frame: "data:image/png;base64,AQ==".into(),
            duration: 3,
        }
    }

    #[test]
    fn data_uri_parsing() {
        let img = InlineImage::from_data_uri("data:image/png;base64,iVBORw0K").unwrap();
        assert_eq!(img.mime_type, "image/png");
        assert_eq!(img.data, "iVBORw0K");
        assert_eq!(img.to_data_uri(), "data:image/png;base64,iVBORw0K");
        assert!(InlineImage::from_data_uri("https://cdn.example.com/a.png").is_none());
        assert!(InlineImage::from_data_uri("data:image/png,raw").is_none());
    }

    #[test]
    fn inline_image_from_bytes_round_trips() {
        let img = InlineImage::from_bytes("image/jpeg", &[0xFF, 0xD8, 0xFF]);
        assert_eq!(img.decode().unwrap(), vec![0xFF, 0xD8, 0xFF]);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_succeeded() {
        let job = ScriptedJob::new(vec![
            report(JobStatus::Starting),
            report(JobStatus::Processing),
            JobReport {
                output: Some("https://replicate.delivery/out.mp4".into()),
                ..report(JobStatus::Succeeded)
            },
        ]);
        let start = Instant::now();
        let done = generate_video(&job, &request(), &PollSchedule::default())
            .await
            .unwrap();
        assert_eq!(done.job_id, "job-1");
        assert_eq!(done.url, "https://replicate.delivery/out.mp4");
        assert_eq!(job.polls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_ceiling_is_a_timeout() {
        let job = ScriptedJob::new(vec![report(JobStatus::Processing)]);
        let start = Instant::now();
        let err = generate_video(&job, &request(), &PollSchedule::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GenerationError::Timeout {
                job_id: "job-1".into(),
                polls: 180
            }
        );
        assert_eq!(job.polls.load(Ordering::SeqCst), 180);
        assert_eq!(start.elapsed(), Duration::from_secs(10 * 3 + 170 * 5));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_is_classified_by_message() {
        let job = ScriptedJob::new(vec![JobReport {
            error: Some("Invalid input: image too small".into()),
            ..report(JobStatus::Failed)
        }]);
        let err = generate_video(&job, &request(), &PollSchedule::default())
            .await
            .unwrap_err();
        assert!(err.is_permanent(), "got {err:?}");

        let job = ScriptedJob::new(vec![JobReport {
            error: Some("CUDA out of memory".into()),
            ..report(JobStatus::Canceled)
        }]);
        let err = generate_video(&job, &request(), &PollSchedule::default())
            .await
            .unwrap_err();
        assert!(!err.is_permanent(), "got {err:?}");
        assert!(err.to_string().contains("canceled"));
    }

    #[tokio::test]
    async fn succeeded_without_output_is_transient() {
        let job = ScriptedJob::new(vec![report(JobStatus::Succeeded)]);
        let err = generate_video(&job, &request(), &PollSchedule::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Transient { .. }));
    }
}

//! Replicate predictions adapter.
//!
//! * `GET  /models/{owner}/{name}` → `latest_version.id`, fetched once per
//!   provider instance and cached.
//! * `POST /predictions` with `{version, input}` → prediction id.
//! * `GET  /predictions/{id}` → status, output, error, logs.
//!
//! Prediction output comes in three shapes depending on the model: a plain
//! URL string, an array of URLs (the first one is used), or an object with a
//! `url` field.

use super::{JobReport, JobStatus, VideoProvider, VideoRequest};
use crate::config::GenerationConfig;
use crate::error::{FlipbookError, GenerationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const PROVIDER: &str = "replicate";

/// Video provider backed by a Replicate image-to-video model.
#[derive(Debug)]
pub struct ReplicateVideoProvider {
    http: reqwest::Client,
    base: String,
    api_key: Option<String>,
    model: String,
    resolution: String,
    aspect_ratio: String,
    fps: u32,
    version: OnceCell<String>,
}

impl ReplicateVideoProvider {
    pub fn new(config: &GenerationConfig) -> Result<Self, FlipbookError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_secs))
            .build()
            .map_err(|e| FlipbookError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            base: config.video_api_base.clone(),
            api_key: config.video_api_key.clone(),
            model: config.video_model.clone(),
            resolution: config.video_resolution.clone(),
            aspect_ratio: config.video_aspect_ratio.clone(),
            fps: config.video_fps,
            version: OnceCell::new(),
        })
    }

    fn api_key(&self) -> Result<&str, GenerationError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| GenerationError::Configuration {
                provider: PROVIDER.into(),
                detail: "video API token not configured".into(),
            })
    }

    fn input<'a>(&'a self, request: &'a VideoRequest) -> PredictionInput<'a> {
        PredictionInput {
            prompt: &request.prompt,
            image: &request.first_frame,
            last_frame_image: &request.last_frame,
            duration: request.duration,
            resolution: &self.resolution,
            aspect_ratio: &self.aspect_ratio,
            fps: self.fps,
            camera_fixed: false,
        }
    }

    async fn latest_version(&self) -> Result<&str, GenerationError> {
        let version = self
            .version
            .get_or_try_init(|| async {
                let key = self.api_key()?;
                let url = format!("{}/models/{}", self.base, self.model);
                let response = self
                    .http
                    .get(&url)
                    .header("Authorization", format!("Token {key}"))
                    .send()
                    .await
                    .map_err(|e| GenerationError::from_message(PROVIDER, None, e.to_string()))?;
                let model: ModelInfo = read_json(response, "Failed to fetch model").await?;
                let id = model
                    .latest_version
                    .map(|v| v.id)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| GenerationError::Transient {
                        provider: PROVIDER.into(),
                        status: None,
                        message: format!("no latest version found for {}", self.model),
                    })?;
                info!("{}: using {} version {}", PROVIDER, self.model, id);
                Ok::<_, GenerationError>(id)
            })
            .await?;
        Ok(version.as_str())
    }
}

#[async_trait]
impl VideoProvider for ReplicateVideoProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn create(&self, request: &VideoRequest) -> Result<String, GenerationError> {
        let key = self.api_key()?;
        let version = self.latest_version().await?;
        let body = CreatePrediction {
            version,
            input: self.input(request),
        };
        let response = self
            .http
            .post(format!("{}/predictions", self.base))
            .header("Authorization", format!("Token {key}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::from_message(PROVIDER, None, e.to_string()))?;
        let prediction: PredictionBody = read_json(response, "Replicate API error").await?;
        debug!("{}: prediction {} is {}", PROVIDER, prediction.id, prediction.status);
        Ok(prediction.id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobReport, GenerationError> {
        let key = self.api_key()?;
        let response = self
            .http
            .get(format!("{}/predictions/{}", self.base, job_id))
            .header("Authorization", format!("Token {key}"))
            .send()
            .await
            .map_err(|e| GenerationError::from_message(PROVIDER, None, e.to_string()))?;
        let prediction: PredictionBody = read_json(response, "Failed to poll prediction").await?;
        Ok(prediction.into_report())
    }
}

/// Decode a successful JSON body, or turn a non-2xx response into a
/// classified error carrying the status and body text.
async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    context: &str,
) -> Result<T, GenerationError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(GenerationError::from_message(
            PROVIDER,
            Some(status.as_u16()),
            format!("{context}: {} - {text}", status.as_u16()),
        ));
    }
    response
        .json()
        .await
        .map_err(|e| GenerationError::from_message(PROVIDER, None, format!("{context}: {e}")))
}

/// URL from any of the known output shapes.
fn output_url(output: &Value) -> Option<String> {
    match output {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(|v| v.as_str()).map(str::to_string),
        Value::Object(map) => map.get("url").and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct CreatePrediction<'a> {
    version: &'a str,
    input: PredictionInput<'a>,
}

#[derive(Serialize)]
struct PredictionInput<'a> {
    prompt: &'a str,
    image: &'a str,
    last_frame_image: &'a str,
    duration: u32,
    resolution: &'a str,
    aspect_ratio: &'a str,
    fps: u32,
    camera_fixed: bool,
}

#[derive(Deserialize)]
struct ModelInfo {
    latest_version: Option<ModelVersion>,
}

#[derive(Deserialize)]
struct ModelVersion {
    id: String,
}

#[derive(Deserialize)]
struct PredictionBody {
    id: String,
    status: JobStatus,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Value,
    logs: Option<String>,
}

impl PredictionBody {
    fn into_report(self) -> JobReport {
        let error = match self.error {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        };
        JobReport {
            status: self.status,
            output: output_url(&self.output),
            error,
            logs: self.logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> ReplicateVideoProvider {
        ReplicateVideoProvider::new(&GenerationConfig::default()).unwrap()
    }

    #[test]
    fn output_shapes() {
        assert_eq!(
            output_url(&json!("https://x/a.mp4")).as_deref(),
            Some("https://x/a.mp4")
        );
        assert_eq!(
            output_url(&json!(["https://x/a.mp4", "https://x/b.mp4"])).as_deref(),
            Some("https://x/a.mp4")
        );
        assert_eq!(
            output_url(&json!({"url": "https://x/c.mp4"})).as_deref(),
            Some("https://x/c.mp4")
        );
        assert!(output_url(&json!(null)).is_none());
        assert!(output_url(&json!([])).is_none());
        assert!(output_url(&json!(42)).is_none());
    }

    #[test]
    fn prediction_body_to_report() {
        let body: PredictionBody = serde_json::from_value(json!({
            "id": "p1",
            "status": "failed",
            "output": null,
            "error": {"detail": "NSFW content detected"},
            "logs": "step 1\nstep 2"
        }))
        .unwrap();
        let report = body.into_report();
        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.output.is_none());
        assert!(report.error.unwrap().contains("NSFW"));

        let body: PredictionBody =
            serde_json::from_value(json!({"id": "p2", "status": "booting"})).unwrap();
        assert_eq!(body.into_report().status, JobStatus::Unknown);
    }

    #[test]
    fn input_carries_frames_and_render_settings() {
        let p = provider();
        let req = VideoRequest {
            prompt: "open".into(),
            first_frame: "data:image/png;base64,AA==".into(),
            last_frame: "data:image/png;base64,AQ==".into(),
            duration: 2,
        };
        let body = serde_json::to_value(CreatePrediction {
            version: "v1",
            input: p.input(&req),
        })
        .unwrap();
        assert_eq!(
            body,
            json!({
                "version": "v1",
                "input": {
                    "prompt": "open",
                    "image": "data:image/png;base64,AA==",
                    "last_frame_image": "data:image/png;base64,AQ==",
                    "duration": 2,
                    "resolution": "1080p",
                    "aspect_ratio": "1:1",
                    "fps": 24,
                    "camera_fixed": false
                }
            })
        );
    }

    #[tokio::test]
    async fn missing_token_is_a_configuration_error() {
        let p = provider();
        let err = p.poll("p1").await.unwrap_err();
        assert!(matches!(err, GenerationError::Configuration { .. }));
        let err = p
            .create(&VideoRequest {
                prompt: String::new(),
                first_frame: String::new(),
                last_frame: String::new(),
                duration: 3,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Configuration { .. }));
    }
}

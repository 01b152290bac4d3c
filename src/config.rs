//! Configuration types for flipbook generation.
//!
//! Every knob of a run lives in [`GenerationConfig`], built through
//! [`GenerationConfigBuilder`]. One struct is easy to share across concurrent
//! tasks, easy to log, and makes two runs trivially comparable.
//!
//! Defaults reproduce the production setup: Gemini image generation at
//! `1:1`/`2K`, Seedance video at `1080p`/24 fps, three video attempts with
//! 2 s → 4 s backoff, flip videos five at a time, and status polling that
//! gives up after roughly fifteen minutes.

use crate::error::FlipbookError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default Gemini endpoint. Point this at a proxy to attach credentials
/// server-side.
pub const DEFAULT_IMAGE_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// Default Replicate endpoint.
pub const DEFAULT_VIDEO_API_BASE: &str = "https://api.replicate.com/v1";

/// Configuration for image and video generation runs.
///
/// Built via [`GenerationConfig::builder()`] or using
/// [`GenerationConfig::default()`].
///
/// # Example
/// ```rust
/// use pdf2flipbook::GenerationConfig;
///
/// let config = GenerationConfig::builder()
///     .image_api_key("AIza...")
///     .video_api_key("r8_...")
///     .flip_batch_width(3)
///     .build()
///     .unwrap();
/// assert_eq!(config.flip_batch_width, 3);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    // ── Image provider ───────────────────────────────────────────────────
    /// Base URL of the image API (or the proxy in front of it).
    pub image_api_base: String,

    /// Image API key. `None` makes every image call fail with a
    /// configuration error.
    #[serde(skip)]
    pub image_api_key: Option<String>,

    /// Image model identifier. Default: `gemini-3-pro-image-preview`.
    pub image_model: String,

    /// Requested output aspect ratio. Default: `1:1`.
    pub image_aspect_ratio: String,

    /// Requested output size tier. Default: `2K`.
    pub image_size: String,

    /// Retry policy for image calls. Default: 3 attempts, base 2.
    pub image_retry: RetryPolicy,

    // ── Video provider ───────────────────────────────────────────────────
    /// Base URL of the video API (or the proxy in front of it).
    pub video_api_base: String,

    /// Video API token.
    #[serde(skip)]
    pub video_api_key: Option<String>,

    /// Video model, `owner/name`. Default: `bytedance/seedance-1-pro`.
    pub video_model: String,

    /// Default: `1080p`.
    pub video_resolution: String,

    /// Default: `1:1`.
    pub video_aspect_ratio: String,

    /// Default: 24.
    pub video_fps: u32,

    /// Length of the opening clip in seconds. Default: 2.
    pub opening_duration_secs: u32,

    /// Length of each page-flip clip in seconds. Default: 3.
    pub flip_duration_secs: u32,

    /// Retry policy for video jobs. Default: 3 attempts, base 2.
    pub video_retry: RetryPolicy,

    /// How many flip videos may be in flight at once. Default: 5.
    ///
    /// Each batch fully settles before the next one starts, so this is also
    /// the maximum number of concurrent jobs on the provider's meter.
    pub flip_batch_width: usize,

    /// Status-polling cadence and ceiling for video jobs.
    pub poll: PollSchedule,

    // ── Transport ────────────────────────────────────────────────────────
    /// Per-HTTP-request timeout in seconds. Default: 300.
    ///
    /// Image generation answers in a single long request; this is the only
    /// bound on it.
    pub api_timeout_secs: u64,

    /// Timeout for downloading PDFs and remote artifacts. Default: 120.
    pub download_timeout_secs: u64,

    // ── Upload pipeline ──────────────────────────────────────────────────
    /// Longest edge, in pixels, of a rasterised source page. Default: 2000.
    pub max_rendered_pixels: u32,

    /// JPEG quality for source pages (1–100). Default: 95.
    pub jpeg_quality: u8,

    /// PDF user password for encrypted documents.
    #[serde(skip)]
    pub password: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            image_api_base: DEFAULT_IMAGE_API_BASE.to_string(),
            image_api_key: None,
            image_model: "gemini-3-pro-image-preview".to_string(),
            image_aspect_ratio: "1:1".to_string(),
            image_size: "2K".to_string(),
            image_retry: RetryPolicy::default(),
            video_api_base: DEFAULT_VIDEO_API_BASE.to_string(),
            video_api_key: None,
            video_model: "bytedance/seedance-1-pro".to_string(),
            video_resolution: "1080p".to_string(),
            video_aspect_ratio: "1:1".to_string(),
            video_fps: 24,
            opening_duration_secs: 2,
            flip_duration_secs: 3,
            video_retry: RetryPolicy::default(),
            flip_batch_width: 5,
            poll: PollSchedule::default(),
            api_timeout_secs: 300,
            download_timeout_secs: 120,
            max_rendered_pixels: 2000,
            jpeg_quality: 95,
            password: None,
        }
    }
}

impl fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |k: &Option<String>| k.as_ref().map(|_| "<redacted>");
        f.debug_struct("GenerationConfig")
            .field("image_api_base", &self.image_api_base)
            .field("image_api_key", &redact(&self.image_api_key))
            .field("image_model", &self.image_model)
            .field("image_retry", &self.image_retry)
            .field("video_api_base", &self.video_api_base)
            .field("video_api_key", &redact(&self.video_api_key))
            .field("video_model", &self.video_model)
            .field("video_retry", &self.video_retry)
            .field("flip_batch_width", &self.flip_batch_width)
            .field("poll", &self.poll)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .finish()
    }
}

impl GenerationConfig {
    /// Create a new builder for `GenerationConfig`.
    pub fn builder() -> GenerationConfigBuilder {
        GenerationConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`GenerationConfig`].
#[derive(Debug)]
pub struct GenerationConfigBuilder {
    config: GenerationConfig,
}

impl GenerationConfigBuilder {
    pub fn image_api_base(mut self, url: impl Into<String>) -> Self {
        self.config.image_api_base = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn image_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.image_api_key = Some(key.into()).filter(|k| !k.is_empty());
        self
    }

    pub fn image_model(mut self, model: impl Into<String>) -> Self {
        self.config.image_model = model.into();
        self
    }

    pub fn image_aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.config.image_aspect_ratio = ratio.into();
        self
    }

    pub fn image_size(mut self, size: impl Into<String>) -> Self {
        self.config.image_size = size.into();
        self
    }

    pub fn image_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.image_retry = policy;
        self
    }

    pub fn video_api_base(mut self, url: impl Into<String>) -> Self {
        self.config.video_api_base = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn video_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.video_api_key = Some(key.into()).filter(|k| !k.is_empty());
        self
    }

    pub fn video_model(mut self, model: impl Into<String>) -> Self {
        self.config.video_model = model.into();
        self
    }

    pub fn video_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.config.video_resolution = resolution.into();
        self
    }

    pub fn video_aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.config.video_aspect_ratio = ratio.into();
        self
    }

    pub fn video_fps(mut self, fps: u32) -> Self {
        self.config.video_fps = fps.clamp(1, 60);
        self
    }

    /// Opening clip length; at least one second.
    pub fn opening_duration_secs(mut self, secs: u32) -> Self {
        self.config.opening_duration_secs = secs.max(1);
        self
    }

    /// Page-flip clip length; at least one second.
    pub fn flip_duration_secs(mut self, secs: u32) -> Self {
        self.config.flip_duration_secs = secs.max(1);
        self
    }

    pub fn video_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.video_retry = policy;
        self
    }

    pub fn flip_batch_width(mut self, n: usize) -> Self {
        self.config.flip_batch_width = n.max(1);
        self
    }

    pub fn poll(mut self, schedule: PollSchedule) -> Self {
        self.config.poll = schedule;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<GenerationConfig, FlipbookError> {
        let c = &self.config;
        if c.image_retry.max_attempts == 0 || c.video_retry.max_attempts == 0 {
            return Err(FlipbookError::InvalidConfig(
                "Retry policies need at least one attempt".into(),
            ));
        }
        if c.flip_batch_width == 0 {
            return Err(FlipbookError::InvalidConfig(
                "Flip batch width must be ≥ 1".into(),
            ));
        }
        if c.poll.max_polls == 0 {
            return Err(FlipbookError::InvalidConfig(
                "Video polling needs at least one poll".into(),
            ));
        }
        if c.image_aspect_ratio.is_empty() || c.video_aspect_ratio.is_empty() {
            return Err(FlipbookError::InvalidConfig(
                "Aspect ratios must not be empty".into(),
            ));
        }
        if c.video_model.split_once('/').is_none() {
            return Err(FlipbookError::InvalidConfig(format!(
                "Video model must be 'owner/name', got '{}'",
                c.video_model
            )));
        }
        Ok(self.config)
    }
}

// ── Polling ──────────────────────────────────────────────────────────────

/// When to poll a video job and when to give up.
///
/// Video jobs typically take one to three minutes. Polling every 3 s for the
/// first half-minute catches quick renders early; after that every 5 s is
/// plenty. 180 polls ≈ 15 minutes is the hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSchedule {
    /// Hard ceiling on status requests. Default: 180.
    pub max_polls: u32,
    /// How many polls use the fast interval. Default: 10.
    pub fast_polls: u32,
    /// Default: 3000.
    pub fast_interval_ms: u64,
    /// Default: 5000.
    pub slow_interval_ms: u64,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            max_polls: 180,
            fast_polls: 10,
            fast_interval_ms: 3000,
            slow_interval_ms: 5000,
        }
    }
}

impl PollSchedule {
    /// Wait after the `poll`-th (0-based) non-terminal status.
    pub fn interval_after(&self, poll: u32) -> Duration {
        if poll < self.fast_polls {
            Duration::from_millis(self.fast_interval_ms)
        } else {
            Duration::from_millis(self.slow_interval_ms)
        }
    }
}

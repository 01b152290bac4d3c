//! # pdf2flipbook
//!
//! Turn a PDF into an illustrated flipbook: one AI-generated image per
//! spread, then AI-generated transition clips between consecutive images.
//!
//! ## Why this crate?
//!
//! Both generation services are slow, flaky and rate-limited. Calling them
//! naively either serialises a 40-spread book into an hour of waiting or
//! fires 40 concurrent requests and gets throttled. Images also depend on
//! each other: every spread is generated against an earlier image so the
//! visual style stays consistent. This crate owns that ordering, the
//! bounded fan-out, per-item retries and the durable record of what has been
//! produced, so a failed spread can be regenerated without redoing the book.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Upload   resolve path/URL, rasterise pages via pdfium, name them
//!  │              (Cover Page, 1-left, 1-right, …)
//!  ├─ 2. Images   cover ─▶ spread-1 ─▶ spread-2..N (parallel)
//!  ├─ 3. Videos   opening ─▶ page flips in batches of 5
//!  └─ 4. Output   records in the artifact store, files via an optional sink
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2flipbook::{Engine, GenerationConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GenerationConfig::builder()
//!         .image_api_key(std::env::var("GEMINI_API_KEY")?)
//!         .video_api_key(std::env::var("REPLICATE_API_TOKEN")?)
//!         .build()?;
//!     let engine = Engine::builder(config).build()?;
//!
//!     let pages = engine.ingest("book.pdf").await?;
//!     let images = engine.run_image_generation(&pages).await?;
//!     let videos = engine.run_video_generation(&images).await?;
//!     eprintln!("{} images, {} videos", images.len(), videos.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2flipbook` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `auto-pdfium` | off | Downloads and caches libpdfium when `PDFIUM_LIB_PATH` is unset |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdf2flipbook = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod schedule;
pub mod sink;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use client::{
    GeminiImageProvider, ImageProvider, ImageRequest, InlineImage, JobReport, JobStatus,
    ReplicateVideoProvider, VideoProvider, VideoRequest,
};
pub use config::{GenerationConfig, GenerationConfigBuilder, PollSchedule};
pub use engine::{Engine, EngineBuilder};
pub use error::{AttemptError, FlipbookError, GenerationError};
pub use model::{
    ArtifactKey, GeneratedImage, GeneratedVideo, ImageKey, ImageSet, PageKey, SourcePage,
    SourcePages, VideoKey, VideoSet,
};
pub use progress::{
    ProgressHandle, ProgressObserver, ProgressState, ProgressTracker, RunKind, StatusValue,
};
pub use retry::RetryPolicy;
pub use sink::{ArtifactMeta, ArtifactSink, DirectorySink, NoopSink, SinkHandle};
pub use store::{ArtifactStore, Artifacts, FileStore, MemoryStore, StoreName};

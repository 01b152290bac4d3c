//! The orchestration engine: bulk runs, single-item regeneration, start over.
//!
//! [`Engine`] composes every other module:
//!
//! ```text
//! Artifacts (store) ──▶ plan (schedule) ──▶ drive ──▶ task
//!                                                      │
//!                          retry policy ◀── provider ◀─┤
//!                                                      ├─▶ Artifacts::upsert_*
//!                                                      ├─▶ ProgressTracker::transition
//!                                                      └─▶ ArtifactSink::deliver
//! ```
//!
//! Every task, in a bulk run or a regeneration, follows the same sequence:
//! `generating` → provider call(s) through the retry policy → persist the
//! record → `complete` → hand the artifact to the sink. Any failure before the
//! record is persisted marks the key `failed` and leaves every other key alone.
//!
//! Each run kind (images, videos) owns one [`ProgressTracker`]. A bulk run
//! replaces it; regeneration reuses it, or rebuilds it from the store when the
//! process has no active run (e.g. after a restart).

use crate::client::{
    generate_video, GeminiImageProvider, ImageProvider, ImageRequest, InlineImage,
    ReplicateVideoProvider, VideoProvider, VideoRequest,
};
use crate::config::GenerationConfig;
use crate::error::{AttemptError, FlipbookError, GenerationError};
use crate::model::{
    highest_spread, ArtifactKey, GeneratedImage, GeneratedVideo, ImageKey, ImageSet, SourcePage,
    SourcePages, VideoKey, VideoSet,
};
use crate::pipeline;
use crate::progress::{
    NoopProgressObserver, ProgressHandle, ProgressState, ProgressTracker, RunKind, StatusValue,
};
use crate::prompts;
use crate::retry::execute_with_retry;
use crate::schedule::{
    drive, image_plan, resolve_reference, video_plan, ImageTask, Plan, PlanTask, VideoTask,
};
use crate::sink::{ArtifactMeta, SinkHandle};
use crate::store::{ArtifactStore, Artifacts, MemoryStore};
use chrono::Utc;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Drives image and video generation runs against a store.
///
/// Build one with [`Engine::builder`].
pub struct Engine {
    config: GenerationConfig,
    image_provider: Arc<dyn ImageProvider>,
    video_provider: Arc<dyn VideoProvider>,
    artifacts: Artifacts,
    sink: Option<SinkHandle>,
    observer: ProgressHandle,
    image_tracker: Mutex<Option<Arc<ProgressTracker>>>,
    video_tracker: Mutex<Option<Arc<ProgressTracker>>>,
}

/// Builder for [`Engine`].
///
/// Providers default to the HTTP adapters configured from
/// [`GenerationConfig`], the store to an in-memory one, and the observer to
/// a no-op. Without a sink nothing is auto-downloaded.
pub struct EngineBuilder {
    config: GenerationConfig,
    image_provider: Option<Arc<dyn ImageProvider>>,
    video_provider: Option<Arc<dyn VideoProvider>>,
    store: Option<Arc<dyn ArtifactStore>>,
    sink: Option<SinkHandle>,
    observer: Option<ProgressHandle>,
}

impl EngineBuilder {
    pub fn image_provider(mut self, provider: Arc<dyn ImageProvider>) -> Self {
        self.image_provider = Some(provider);
        self
    }

    pub fn video_provider(mut self, provider: Arc<dyn VideoProvider>) -> Self {
        self.video_provider = Some(provider);
        self
    }

    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sink(mut self, sink: SinkHandle) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn observer(mut self, observer: ProgressHandle) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<Engine, FlipbookError> {
        let image_provider: Arc<dyn ImageProvider> = match self.image_provider {
            Some(p) => p,
            None => Arc::new(GeminiImageProvider::new(&self.config)?),
        };
        let video_provider: Arc<dyn VideoProvider> = match self.video_provider {
            Some(p) => p,
            None => Arc::new(ReplicateVideoProvider::new(&self.config)?),
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        Ok(Engine {
            config: self.config,
            image_provider,
            video_provider,
            artifacts: Artifacts::new(store),
            sink: self.sink,
            observer: self
                .observer
                .unwrap_or_else(|| Arc::new(NoopProgressObserver)),
            image_tracker: Mutex::new(None),
            video_tracker: Mutex::new(None),
        })
    }
}

impl Engine {
    pub fn builder(config: GenerationConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            image_provider: None,
            video_provider: None,
            store: None,
            sink: None,
            observer: None,
        }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    // ── Upload ───────────────────────────────────────────────────────────

    /// Rasterise `input` (path or URL) and make it the current document.
    ///
    /// Previously generated images and videos are discarded.
    pub async fn ingest(&self, input: &str) -> Result<SourcePages, FlipbookError> {
        let pages = pipeline::extract_pages(input, &self.config).await?;
        self.ingest_pages(&pages).await?;
        Ok(pages)
    }

    /// Make already-extracted `pages` the current document.
    pub async fn ingest_pages(&self, pages: &SourcePages) -> Result<(), FlipbookError> {
        if pages.is_empty() {
            return Err(FlipbookError::InvalidInput {
                input: "document without pages".into(),
            });
        }
        self.start_over().await?;
        self.artifacts.save_pages(pages).await
    }

    /// Clear all three stores and forget both trackers.
    pub async fn start_over(&self) -> Result<(), FlipbookError> {
        self.artifacts.clear_all().await?;
        *lock(&self.image_tracker) = None;
        *lock(&self.video_tracker) = None;
        info!("Cleared all stored artifacts");
        Ok(())
    }

    // ── Bulk runs ────────────────────────────────────────────────────────

    /// Generate the cover and every spread of `pages`.
    ///
    /// Returns whatever subset succeeded. Failed spreads are only visible as
    /// `failed` in [`image_progress`](Self::image_progress) and can be
    /// regenerated one by one.
    ///
    /// Stored videos are kept even though they were made from the images
    /// this run replaces; run [`run_video_generation`](Self::run_video_generation)
    /// again to bring them in line.
    ///
    /// # Errors
    /// [`FlipbookError::StageFailed`] when the cover or the first spread
    /// fails; no later image is started.
    pub async fn run_image_generation(
        &self,
        pages: &SourcePages,
    ) -> Result<ImageSet, FlipbookError> {
        let plan = image_plan(pages.spread_count());
        info!(
            "Image run: {} pages → {} images",
            pages.len(),
            plan.total()
        );
        self.artifacts.reset_images().await?;
        let tracker = self.begin_run(RunKind::Images, &plan);

        self.drive_plan(&plan, |task| self.run_image_task(task, pages, &tracker))
            .await?;
        self.artifacts.load_images().await
    }

    /// Generate the opening clip and every page flip for `images`.
    ///
    /// # Errors
    /// [`FlipbookError::StageFailed`] when the opening clip fails; no flip is
    /// started.
    pub async fn run_video_generation(
        &self,
        images: &ImageSet,
    ) -> Result<VideoSet, FlipbookError> {
        let plan = video_plan(highest_spread(images), self.config.flip_batch_width);
        info!(
            "Video run: {} images → {} videos, batches of {}",
            images.len(),
            plan.total(),
            self.config.flip_batch_width
        );
        self.artifacts.reset_videos().await?;
        let tracker = self.begin_run(RunKind::Videos, &plan);

        self.drive_plan(&plan, |task| self.run_video_task(task, images, &tracker))
            .await?;
        self.artifacts.load_videos().await
    }

    // ── Regeneration ─────────────────────────────────────────────────────

    /// Regenerate the artifact named `key` (`cover`, `spread-3`, `opening`,
    /// `spread-2-3`, …) from the current store contents.
    pub async fn regenerate_one(&self, key: &str) -> Result<ArtifactKey, FlipbookError> {
        let parsed: ArtifactKey = key.parse()?;
        match parsed {
            ArtifactKey::Image(k) => {
                self.regenerate_image(k).await?;
            }
            ArtifactKey::Video(k) => {
                self.regenerate_video(k).await?;
            }
        }
        Ok(parsed)
    }

    /// Regenerate one image, replacing its stored record.
    ///
    /// The reference image is re-derived from the store through the key's
    /// fallback chain. Other keys' records and statuses are untouched.
    pub async fn regenerate_image(&self, key: ImageKey) -> Result<GeneratedImage, FlipbookError> {
        let pages = self.artifacts.load_pages().await?.ok_or_else(|| {
            missing_dependency(&key.to_string(), "extracted pages".to_string())
        })?;
        let tracker = self.tracker(RunKind::Images).await?.ok_or_else(|| {
            missing_dependency(&key.to_string(), "extracted pages".to_string())
        })?;
        self.ensure_in_run(&tracker, &key.to_string())?;

        info!("Regenerating image {}", key);
        self.run_image_task(&ImageTask::for_key(key), &pages, &tracker)
            .await?;
        self.stored_image(key).await
    }

    /// Regenerate one video, replacing its stored record.
    pub async fn regenerate_video(&self, key: VideoKey) -> Result<GeneratedVideo, FlipbookError> {
        let images = self.artifacts.load_images().await?;
        let tracker = self.tracker(RunKind::Videos).await?.ok_or_else(|| {
            missing_dependency(&key.to_string(), "generated images".to_string())
        })?;
        self.ensure_in_run(&tracker, &key.to_string())?;

        info!("Regenerating video {}", key);
        self.run_video_task(&VideoTask::for_key(key), &images, &tracker)
            .await?;
        self.artifacts
            .load_videos()
            .await?
            .remove(&key)
            .ok_or_else(|| FlipbookError::Internal(format!("video {key} vanished after save")))
    }

    // ── Progress ─────────────────────────────────────────────────────────

    /// Snapshot of the active image run, if any.
    pub fn image_progress(&self) -> Option<ProgressState> {
        lock(&self.image_tracker).as_ref().map(|t| t.snapshot())
    }

    /// Snapshot of the active video run, if any.
    pub fn video_progress(&self) -> Option<ProgressState> {
        lock(&self.video_tracker).as_ref().map(|t| t.snapshot())
    }

    /// Tracker for `run`, rebuilt from the store when no run is active.
    ///
    /// `Ok(None)` when there is nothing to track yet (no pages for images,
    /// no images for videos).
    pub async fn tracker(
        &self,
        run: RunKind,
    ) -> Result<Option<Arc<ProgressTracker>>, FlipbookError> {
        let active = lock(self.slot(run)).clone();
        if active.is_some() {
            return Ok(active);
        }

        let (keys, complete) = match run {
            RunKind::Images => {
                let Some(pages) = self.artifacts.load_pages().await? else {
                    return Ok(None);
                };
                let stored = self.artifacts.load_images().await?;
                (
                    image_plan(pages.spread_count()).keys(),
                    stored.keys().map(ToString::to_string).collect::<BTreeSet<_>>(),
                )
            }
            RunKind::Videos => {
                let images = self.artifacts.load_images().await?;
                if images.is_empty() {
                    return Ok(None);
                }
                let stored = self.artifacts.load_videos().await?;
                (
                    video_plan(highest_spread(&images), self.config.flip_batch_width).keys(),
                    stored.keys().map(ToString::to_string).collect::<BTreeSet<_>>(),
                )
            }
        };

        let restored = Arc::new(ProgressTracker::restore(
            run,
            Arc::clone(&self.observer),
            keys,
            &complete,
        ));
        debug!("Restored {} tracker from store", run);
        // Another caller may have restored or started a run meanwhile.
        let mut slot = lock(self.slot(run));
        Ok(Some(Arc::clone(slot.get_or_insert(restored))))
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn slot(&self, run: RunKind) -> &Mutex<Option<Arc<ProgressTracker>>> {
        match run {
            RunKind::Images => &self.image_tracker,
            RunKind::Videos => &self.video_tracker,
        }
    }

    fn begin_run<T: PlanTask>(&self, run: RunKind, plan: &Plan<T>) -> Arc<ProgressTracker> {
        let tracker = Arc::new(ProgressTracker::new(run, Arc::clone(&self.observer)));
        tracker.init(plan.keys());
        *lock(self.slot(run)) = Some(Arc::clone(&tracker));
        tracker
    }

    async fn drive_plan<'p, T, F, Fut>(&self, plan: &'p Plan<T>, run: F) -> Result<(), FlipbookError>
    where
        T: PlanTask,
        F: FnMut(&'p T) -> Fut,
        Fut: Future<Output = Result<(), FlipbookError>>,
    {
        let failures = drive(plan, run).await.map_err(|abort| abort.error)?;
        if !failures.is_empty() {
            let keys: Vec<&str> = failures.iter().map(|(k, _)| k.as_str()).collect();
            warn!(
                "{} item(s) failed and can be regenerated: {}",
                failures.len(),
                keys.join(", ")
            );
        }
        Ok(())
    }

    fn ensure_in_run(&self, tracker: &ProgressTracker, key: &str) -> Result<(), FlipbookError> {
        if tracker.contains(key) {
            Ok(())
        } else {
            Err(FlipbookError::UnknownKey {
                key: key.to_string(),
                run: tracker.run().to_string(),
            })
        }
    }

    async fn stored_image(&self, key: ImageKey) -> Result<GeneratedImage, FlipbookError> {
        self.artifacts
            .load_images()
            .await?
            .remove(&key)
            .ok_or_else(|| FlipbookError::Internal(format!("image {key} vanished after save")))
    }

    /// Run one image task end to end.
    async fn run_image_task(
        &self,
        task: &ImageTask,
        pages: &SourcePages,
        tracker: &ProgressTracker,
    ) -> Result<(), FlipbookError> {
        let key = task.key.to_string();
        tracker.transition(&key, StatusValue::Generating)?;

        let outcome = async {
            let stored = self.artifacts.load_images().await?;
            let request = image_request(task, pages, &stored)
                .map_err(|e| stage_failed(&key, AttemptError::before_call(e)))?;

            let provider = &self.image_provider;
            let url = execute_with_retry(
                &self.config.image_retry,
                |_| provider.generate(&request),
                |attempt, max| report_retry(tracker, &key, attempt, max),
            )
            .await
            .map_err(|e| stage_failed(&key, e))?;

            self.artifacts
                .upsert_image(GeneratedImage {
                    key: task.key,
                    url: url.clone(),
                    generated_at: Utc::now(),
                    downloaded: false,
                })
                .await?;
            Ok::<_, FlipbookError>(url)
        }
        .await;

        let url = self.settle(tracker, &key, outcome)?;
        if let Some(at) = self.deliver(ArtifactKey::Image(task.key), &url).await {
            debug!("{} downloaded at {}", key, at);
            if let Err(e) = self.artifacts.mark_image_downloaded(task.key).await {
                warn!("{}: could not record download: {}", key, e);
            }
        }
        Ok(())
    }

    /// Run one video task end to end.
    async fn run_video_task(
        &self,
        task: &VideoTask,
        images: &ImageSet,
        tracker: &ProgressTracker,
    ) -> Result<(), FlipbookError> {
        let key = task.key.to_string();
        tracker.transition(&key, StatusValue::Generating)?;

        let outcome = async {
            let request = video_request(task, images, &self.config)
                .map_err(|e| stage_failed(&key, AttemptError::before_call(e)))?;

            let provider = self.video_provider.as_ref();
            let poll = &self.config.poll;
            let finished = execute_with_retry(
                &self.config.video_retry,
                |_| generate_video(provider, &request, poll),
                |attempt, max| report_retry(tracker, &key, attempt, max),
            )
            .await
            .map_err(|e| stage_failed(&key, e))?;

            self.artifacts
                .upsert_video(GeneratedVideo {
                    key: task.key,
                    url: finished.url.clone(),
                    filename: task.key.filename(),
                    duration: request.duration,
                    start_frame: task.first_frame,
                    end_frame: task.last_frame,
                    prediction_id: finished.job_id,
                    generated_at: Utc::now(),
                    downloaded_at: None,
                })
                .await?;
            Ok::<_, FlipbookError>(finished.url)
        }
        .await;

        let url = self.settle(tracker, &key, outcome)?;
        if let Some(at) = self.deliver(ArtifactKey::Video(task.key), &url).await {
            if let Err(e) = self.artifacts.mark_video_downloaded(task.key, at).await {
                warn!("{}: could not record download: {}", key, e);
            }
        }
        Ok(())
    }

    /// Move `key` to its terminal status for `outcome`.
    fn settle<T>(
        &self,
        tracker: &ProgressTracker,
        key: &str,
        outcome: Result<T, FlipbookError>,
    ) -> Result<T, FlipbookError> {
        match outcome {
            Ok(value) => {
                tracker.transition(key, StatusValue::Complete)?;
                info!("{} complete", key);
                Ok(value)
            }
            Err(e) => {
                warn!("{} failed: {}", key, e);
                tracker.transition(key, StatusValue::Failed)?;
                Err(e)
            }
        }
    }

    /// Hand a finished artifact to the sink. Returns the delivery time on
    /// success; failures are logged and swallowed.
    async fn deliver(&self, key: ArtifactKey, url: &str) -> Option<chrono::DateTime<Utc>> {
        let sink = self.sink.as_ref()?;
        let meta = ArtifactMeta {
            key,
            filename: key.filename(),
        };
        match sink.deliver(url, &meta).await {
            Ok(()) => Some(Utc::now()),
            Err(e) => {
                warn!("Auto-download of {} failed: {}", key, e);
                None
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn stage_failed(key: &str, source: AttemptError) -> FlipbookError {
    FlipbookError::StageFailed {
        key: key.to_string(),
        source,
    }
}

fn missing_dependency(key: &str, missing: String) -> FlipbookError {
    stage_failed(
        key,
        AttemptError::before_call(GenerationError::DependencyMissing {
            key: key.to_string(),
            missing,
        }),
    )
}

fn report_retry(tracker: &ProgressTracker, key: &str, attempt: u32, max: u32) {
    if let Err(e) = tracker.transition(key, StatusValue::Retrying { attempt, max }) {
        warn!("{}: could not report retry: {}", key, e);
    }
}

/// Prompt, then the resolved reference image (when it is inline data), then
/// the task's source pages.
fn image_request(
    task: &ImageTask,
    pages: &SourcePages,
    images: &ImageSet,
) -> Result<ImageRequest, GenerationError> {
    let mut inline = Vec::with_capacity(task.pages.len() + 1);

    if let Some((ref_key, reference)) = resolve_reference(task.key, &task.references, images)? {
        match InlineImage::from_data_uri(&reference.url) {
            Some(img) => inline.push(img),
            None => warn!(
                "{}: reference {} is a remote URL, sending without it",
                task.key, ref_key
            ),
        }
    }

    for page_key in &task.pages {
        let page = pages
            .get(*page_key)
            .ok_or_else(|| GenerationError::DependencyMissing {
                key: task.key.to_string(),
                missing: format!("page {page_key}"),
            })?;
        inline.push(InlineImage::from_bytes(SourcePage::MIME_TYPE, &page.image_bytes));
    }

    Ok(ImageRequest {
        prompt: prompts::image_prompt(task.prompt).to_string(),
        images: inline,
    })
}

fn video_request(
    task: &VideoTask,
    images: &ImageSet,
    config: &GenerationConfig,
) -> Result<VideoRequest, GenerationError> {
    let frame = |k: ImageKey| {
        images
            .get(&k)
            .map(|img| img.url.clone())
            .ok_or_else(|| GenerationError::DependencyMissing {
                key: task.key.to_string(),
                missing: format!("image {k}"),
            })
    };
    let duration = match task.key {
        VideoKey::Opening => config.opening_duration_secs,
        VideoKey::Flip(_) => config.flip_duration_secs,
    };
    Ok(VideoRequest {
        prompt: prompts::video_prompt(task.key).to_string(),
        first_frame: frame(task.first_frame)?,
        last_frame: frame(task.last_frame)?,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ImagePrompt;

    fn pages(n: usize) -> SourcePages {
        SourcePages::from_ordered((0..n).map(|i| (vec![i as u8], 10, 10)).collect())
    }

    fn image(key: ImageKey, url: &str) -> GeneratedImage {
        GeneratedImage {
            key,
            url: url.into(),
            generated_at: Utc::now(),
            downloaded: false,
        }
    }

    #[test]
    fn cover_request_sends_only_the_cover_page() {
        let req = image_request(
            &ImageTask::for_key(ImageKey::Cover),
            &pages(3),
            &ImageSet::new(),
        )
        .unwrap();
        assert_eq!(req.images.len(), 1);
        assert_eq!(req.images[0].decode().unwrap(), vec![0]);
        assert_eq!(req.prompt, prompts::image_prompt(ImagePrompt::Cover));
    }

    #[test]
    fn spread_request_is_reference_then_left_then_right() {
        let mut images = ImageSet::new();
        images.insert(ImageKey::Cover, image(ImageKey::Cover, "data:image/png;base64,Y292ZXI="));
        let req = image_request(
            &ImageTask::for_key(ImageKey::Spread(1)),
            &pages(3),
            &images,
        )
        .unwrap();
        assert_eq!(req.images.len(), 3);
        assert_eq!(req.images[0].mime_type, "image/png");
        assert_eq!(req.images[1].decode().unwrap(), vec![1]);
        assert_eq!(req.images[2].decode().unwrap(), vec![2]);
    }

    #[test]
    fn remote_reference_is_skipped() {
        let mut images = ImageSet::new();
        images.insert(
            ImageKey::Spread(1),
            image(ImageKey::Spread(1), "https://cdn.example.com/s1.png"),
        );
        let req = image_request(
            &ImageTask::for_key(ImageKey::Spread(2)),
            &pages(5),
            &images,
        )
        .unwrap();
        assert_eq!(req.images.len(), 2);
    }

    #[test]
    fn missing_page_is_a_dependency_error() {
        let mut images = ImageSet::new();
        images.insert(ImageKey::Cover, image(ImageKey::Cover, "data:image/png;base64,AA=="));
        let err = image_request(
            &ImageTask::for_key(ImageKey::Spread(2)),
            &pages(3),
            &images,
        )
        .unwrap_err();
        assert!(
            matches!(err, GenerationError::DependencyMissing { ref missing, .. } if missing == "page 2-left"),
            "got {err:?}"
        );
    }

    #[test]
    fn video_request_uses_frames_and_durations() {
        let mut images = ImageSet::new();
        for k in [ImageKey::Cover, ImageKey::Spread(1), ImageKey::Spread(2)] {
            images.insert(k, image(k, &format!("url-{k}")));
        }
        let config = GenerationConfig::default();

        let opening = video_request(&VideoTask::for_key(VideoKey::Opening), &images, &config).unwrap();
        assert_eq!(opening.first_frame, "url-cover");
        assert_eq!(opening.last_frame, "url-spread-1");
        assert_eq!(opening.duration, 2);

        let flip = video_request(&VideoTask::for_key(VideoKey::Flip(1)), &images, &config).unwrap();
        assert_eq!(flip.first_frame, "url-spread-1");
        assert_eq!(flip.last_frame, "url-spread-2");
        assert_eq!(flip.duration, 3);

        let err = video_request(&VideoTask::for_key(VideoKey::Flip(2)), &images, &config).unwrap_err();
        assert!(matches!(err, GenerationError::DependencyMissing { .. }));
    }
}

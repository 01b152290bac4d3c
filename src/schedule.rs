//! Declarative generation plans.
//!
//! A run is described as data: a [`Plan`] is an ordered list of [`Stage`]s,
//! each holding the tasks it runs and a [`StageMode`] saying how. The plan
//! builders below encode the dependency graph between artifacts; [`drive`]
//! executes any plan with the same blocking/fan-out discipline.
//!
//! ```text
//! images:  cover ──▶ spread-1 ──▶ { spread-2 … spread-N }      (unbounded fan-out)
//! videos:  opening ──▶ { spread-1-2 … spread-(N-1)-N }         (batches of 5)
//! ```
//!
//! * **Blocking** stages run their tasks one at a time. The first failure
//!   aborts the plan; no later stage is started.
//! * **Fan-out** stages start every task of a batch at once and wait for the
//!   whole batch to settle before starting the next. Failures are collected
//!   and returned, never propagated.
//!
//! Reference images for spreads follow an explicit fallback chain
//! ([`reference_chain`]): the first entry present in the image set wins.

use crate::error::GenerationError;
use crate::model::{ImageKey, PageKey, VideoKey};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use tracing::{debug, info, warn};

// ── Plan data ────────────────────────────────────────────────────────────

/// How a stage runs its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageMode {
    /// Sequential; any failure aborts the plan.
    Blocking,
    /// Concurrent; failures are isolated. `width` bounds how many tasks are
    /// in flight at once (`None` = all of them).
    FanOut { width: Option<usize> },
}

/// One step of a plan.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub name: &'static str,
    pub mode: StageMode,
    pub tasks: Vec<T>,
}

/// Ordered stages. Stage `n + 1` starts only after stage `n` has settled.
#[derive(Debug, Clone)]
pub struct Plan<T> {
    pub stages: Vec<Stage<T>>,
}

/// Anything a plan can schedule.
pub trait PlanTask {
    /// Progress key of the artifact this task produces.
    fn key(&self) -> String;
}

impl<T: PlanTask> Plan<T> {
    /// Every task key, in plan order.
    pub fn keys(&self) -> Vec<String> {
        self.tasks().map(PlanTask::key).collect()
    }

    /// Number of tasks; the progress `total` of the run.
    pub fn total(&self) -> usize {
        self.stages.iter().map(|s| s.tasks.len()).sum()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &T> {
        self.stages.iter().flat_map(|s| s.tasks.iter())
    }
}

// ── Image plan ───────────────────────────────────────────────────────────

/// Which prompt an image task uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePrompt {
    /// Cover page → 3D book.
    Cover,
    /// First spread, styled after the cover render.
    FirstInterior,
    /// Later spreads, composed after the first spread render.
    RemainingInterior,
}

/// Everything needed to request one image, except the bytes themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTask {
    pub key: ImageKey,
    pub prompt: ImagePrompt,
    /// Source pages sent with the request, in order.
    pub pages: Vec<PageKey>,
    /// Reference candidates, most preferred first. Empty for the cover.
    pub references: Vec<ImageKey>,
}

impl PlanTask for ImageTask {
    fn key(&self) -> String {
        self.key.to_string()
    }
}

impl ImageTask {
    pub fn for_key(key: ImageKey) -> Self {
        match key {
            ImageKey::Cover => Self {
                key,
                prompt: ImagePrompt::Cover,
                pages: vec![PageKey::Cover],
                references: reference_chain(key),
            },
            ImageKey::Spread(n) => Self {
                key,
                prompt: if n == 1 {
                    ImagePrompt::FirstInterior
                } else {
                    ImagePrompt::RemainingInterior
                },
                pages: vec![PageKey::Left(n), PageKey::Right(n)],
                references: reference_chain(key),
            },
        }
    }
}

/// Reference fallback chain for an image key.
///
/// | key | candidates |
/// |-----|------------|
/// | `cover` | none |
/// | `spread-1` | `cover` |
/// | `spread-k` (k ≥ 2) | `spread-1`, `cover` |
pub fn reference_chain(key: ImageKey) -> Vec<ImageKey> {
    match key {
        ImageKey::Cover => Vec::new(),
        ImageKey::Spread(1) => vec![ImageKey::Cover],
        ImageKey::Spread(_) => vec![ImageKey::Spread(1), ImageKey::Cover],
    }
}

/// First candidate of `chain` present in `images`.
///
/// Returns `Ok(None)` for an empty chain (nothing required) and
/// [`GenerationError::DependencyMissing`] when candidates exist but none is
/// available.
pub fn resolve_reference<'a, V>(
    key: ImageKey,
    chain: &[ImageKey],
    images: &'a BTreeMap<ImageKey, V>,
) -> Result<Option<(ImageKey, &'a V)>, GenerationError> {
    if chain.is_empty() {
        return Ok(None);
    }
    chain
        .iter()
        .find_map(|k| images.get(k).map(|v| (*k, v)))
        .map(Some)
        .ok_or_else(|| GenerationError::DependencyMissing {
            key: key.to_string(),
            missing: format!(
                "reference image ({})",
                chain
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" or ")
            ),
        })
}

/// Plan for `spread_count` spreads: cover, spread-1, then the rest at once.
pub fn image_plan(spread_count: u32) -> Plan<ImageTask> {
    let mut stages = vec![Stage {
        name: "cover",
        mode: StageMode::Blocking,
        tasks: vec![ImageTask::for_key(ImageKey::Cover)],
    }];
    if spread_count >= 1 {
        stages.push(Stage {
            name: "first spread",
            mode: StageMode::Blocking,
            tasks: vec![ImageTask::for_key(ImageKey::Spread(1))],
        });
    }
    if spread_count >= 2 {
        stages.push(Stage {
            name: "remaining spreads",
            mode: StageMode::FanOut { width: None },
            tasks: (2..=spread_count)
                .map(|n| ImageTask::for_key(ImageKey::Spread(n)))
                .collect(),
        });
    }
    Plan { stages }
}

// ── Video plan ───────────────────────────────────────────────────────────

/// One transition clip to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoTask {
    pub key: VideoKey,
    pub first_frame: ImageKey,
    pub last_frame: ImageKey,
}

impl PlanTask for VideoTask {
    fn key(&self) -> String {
        self.key.to_string()
    }
}

impl VideoTask {
    pub fn for_key(key: VideoKey) -> Self {
        let (first_frame, last_frame) = key.frames();
        Self {
            key,
            first_frame,
            last_frame,
        }
    }
}

/// Plan for an image set whose highest spread is `highest_spread`: the
/// opening clip, then one flip per consecutive pair in batches of
/// `batch_width`.
///
/// Three spreads give `{opening, spread-1-2, spread-2-3}`.
pub fn video_plan(highest_spread: u32, batch_width: usize) -> Plan<VideoTask> {
    let mut stages = vec![Stage {
        name: "opening",
        mode: StageMode::Blocking,
        tasks: vec![VideoTask::for_key(VideoKey::Opening)],
    }];
    if highest_spread >= 2 {
        stages.push(Stage {
            name: "page flips",
            mode: StageMode::FanOut {
                width: Some(batch_width.max(1)),
            },
            tasks: (1..highest_spread)
                .map(|n| VideoTask::for_key(VideoKey::Flip(n)))
                .collect(),
        });
    }
    Plan { stages }
}

// ── Driver ───────────────────────────────────────────────────────────────

/// A blocking task failed; nothing after it was started.
#[derive(Debug, Clone)]
pub struct StageAbort<E> {
    pub stage: &'static str,
    pub key: String,
    pub error: E,
}

impl<E: fmt::Display> fmt::Display for StageAbort<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage '{}' failed on '{}': {}", self.stage, self.key, self.error)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for StageAbort<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Execute `plan`, calling `run` once per task.
///
/// Returns the isolated fan-out failures `(key, error)` on completion, or
/// [`StageAbort`] as soon as a blocking task fails.
pub async fn drive<'p, T, E, F, Fut>(
    plan: &'p Plan<T>,
    mut run: F,
) -> Result<Vec<(String, E)>, StageAbort<E>>
where
    T: PlanTask,
    E: fmt::Display,
    F: FnMut(&'p T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let mut failures = Vec::new();

    for stage in &plan.stages {
        match stage.mode {
            StageMode::Blocking => {
                for task in &stage.tasks {
                    debug!("Stage '{}': running {}", stage.name, task.key());
                    if let Err(error) = run(task).await {
                        warn!(
                            "Stage '{}' aborted the run: {} failed: {}",
                            stage.name,
                            task.key(),
                            error
                        );
                        return Err(StageAbort {
                            stage: stage.name,
                            key: task.key(),
                            error,
                        });
                    }
                }
            }
            StageMode::FanOut { width } => {
                let width = width.unwrap_or(stage.tasks.len()).max(1);
                for (batch_idx, batch) in stage.tasks.chunks(width).enumerate() {
                    info!(
                        "Stage '{}': batch {} with {} task(s)",
                        stage.name,
                        batch_idx + 1,
                        batch.len()
                    );
                    let results = join_all(batch.iter().map(|task| run(task))).await;
                    for (task, result) in batch.iter().zip(results) {
                        if let Err(error) = result {
                            warn!("{} failed, continuing: {}", task.key(), error);
                            failures.push((task.key(), error));
                        }
                    }
                }
            }
        }
    }

    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AttemptError;
    use std::sync::{Arc, Mutex};
    use tokio::time::{sleep, Duration, Instant};

    fn fail(key: &str) -> AttemptError {
        AttemptError {
            attempts: 3,
            error: GenerationError::Transient {
                provider: "test".into(),
                status: Some(503),
                message: format!("{key} overloaded"),
            },
        }
    }

    #[test]
    fn image_plan_for_two_spreads() {
        let plan = image_plan(2);
        assert_eq!(plan.keys(), vec!["cover", "spread-1", "spread-2"]);
        assert_eq!(plan.total(), 3);
        assert_eq!(plan.stages[0].mode, StageMode::Blocking);
        assert_eq!(plan.stages[1].mode, StageMode::Blocking);
        assert_eq!(plan.stages[2].mode, StageMode::FanOut { width: None });
    }

    #[test]
    fn image_plan_without_spreads_is_cover_only() {
        let plan = image_plan(0);
        assert_eq!(plan.keys(), vec!["cover"]);
        assert_eq!(image_plan(1).stages.len(), 2);
    }

    #[test]
    fn image_tasks_carry_pages_and_prompt() {
        let t = ImageTask::for_key(ImageKey::Spread(3));
        assert_eq!(t.prompt, ImagePrompt::RemainingInterior);
        assert_eq!(t.pages, vec![PageKey::Left(3), PageKey::Right(3)]);
        assert_eq!(ImageTask::for_key(ImageKey::Cover).pages, vec![PageKey::Cover]);
        assert_eq!(
            ImageTask::for_key(ImageKey::Spread(1)).prompt,
            ImagePrompt::FirstInterior
        );
    }

    #[test]
    fn video_plan_for_three_spreads() {
        let plan = video_plan(3, 5);
        assert_eq!(plan.keys(), vec!["opening", "spread-1-2", "spread-2-3"]);
        assert_eq!(plan.total(), 3);
        let flip = plan.tasks().nth(2).unwrap();
        assert_eq!(flip.first_frame, ImageKey::Spread(2));
        assert_eq!(flip.last_frame, ImageKey::Spread(3));
    }

    #[test]
    fn reference_falls_back_to_cover() {
        let mut images = BTreeMap::new();
        images.insert(ImageKey::Cover, "cover-url");
        let chain = reference_chain(ImageKey::Spread(4));
        let (used, url) = resolve_reference(ImageKey::Spread(4), &chain, &images)
            .unwrap()
            .unwrap();
        assert_eq!(used, ImageKey::Cover);
        assert_eq!(*url, "cover-url");

        images.insert(ImageKey::Spread(1), "spread-1-url");
        let (used, _) = resolve_reference(ImageKey::Spread(4), &chain, &images)
            .unwrap()
            .unwrap();
        assert_eq!(used, ImageKey::Spread(1));
    }

    #[test]
    fn missing_reference_is_a_dependency_error() {
        let images: BTreeMap<ImageKey, &str> = BTreeMap::new();
        let err = resolve_reference(
            ImageKey::Spread(1),
            &reference_chain(ImageKey::Spread(1)),
            &images,
        )
        .unwrap_err();
        assert!(matches!(err, GenerationError::DependencyMissing { .. }));
        assert!(resolve_reference(ImageKey::Cover, &[], &images)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn blocking_failure_starts_nothing_after_it() {
        let plan = image_plan(4);
        let started = Mutex::new(Vec::new());
        let result = drive(&plan, |task| {
            started.lock().unwrap().push(task.key());
            let key = task.key();
            async move {
                if key == "cover" {
                    Err(fail(&key))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        let abort = result.unwrap_err();
        assert_eq!(abort.key, "cover");
        assert_eq!(*started.lock().unwrap(), vec!["cover"]);
    }

    #[tokio::test]
    async fn fan_out_failures_are_isolated() {
        let plan = image_plan(5);
        let done = Mutex::new(Vec::new());
        let failures = drive(&plan, |task| {
            let key = task.key();
            let done = &done;
            async move {
                if key == "spread-3" {
                    return Err(fail(&key));
                }
                done.lock().unwrap().push(key);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "spread-3");
        let mut done = done.into_inner().unwrap();
        done.sort();
        assert_eq!(
            done,
            vec!["cover", "spread-1", "spread-2", "spread-4", "spread-5"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn batches_settle_before_the_next_starts() {
        // 8 spreads → opening + 7 flips, width 5.
        let plan = video_plan(8, 5);
        assert_eq!(plan.total(), 8);

        let start = Instant::now();
        let events = Arc::new(Mutex::new(Vec::new()));
        drive(&plan, |task| {
            let events = Arc::clone(&events);
            let key = task.key;
            async move {
                events
                    .lock()
                    .unwrap()
                    .push((key, "start", start.elapsed()));
                // Later flips finish faster, so ordering is not accidental.
                let secs = match key {
                    VideoKey::Opening => 1,
                    VideoKey::Flip(n) => 10 - u64::from(n),
                };
                sleep(Duration::from_secs(secs)).await;
                events.lock().unwrap().push((key, "end", start.elapsed()));
                Ok::<(), AttemptError>(())
            }
        })
        .await
        .unwrap();

        let events = events.lock().unwrap();
        let at = |key: VideoKey, what: &str| {
            events
                .iter()
                .find(|(k, w, _)| *k == key && *w == what)
                .map(|(_, _, t)| *t)
                .unwrap()
        };

        // Batch 1 (flips 1–5) starts together right after the opening.
        for n in 1..=5 {
            assert_eq!(at(VideoKey::Flip(n), "start"), Duration::from_secs(1));
        }
        let batch1_end = (1..=5).map(|n| at(VideoKey::Flip(n), "end")).max().unwrap();
        assert_eq!(batch1_end, Duration::from_secs(10));
        // Batch 2 (flips 6–7) starts only once every batch-1 task settled.
        for n in 6..=7 {
            assert_eq!(at(VideoKey::Flip(n), "start"), batch1_end);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_fan_out_runs_everything_at_once() {
        let plan = image_plan(6);
        let start = Instant::now();
        let starts = Mutex::new(Vec::new());
        drive(&plan, |task| {
            let key = task.key;
            let starts = &starts;
            async move {
                if let ImageKey::Spread(n) = key {
                    if n >= 2 {
                        starts.lock().unwrap().push(start.elapsed());
                    }
                }
                sleep(Duration::from_secs(1)).await;
                Ok::<(), AttemptError>(())
            }
        })
        .await
        .unwrap();
        let starts = starts.into_inner().unwrap();
        assert_eq!(starts.len(), 5);
        assert!(starts.iter().all(|t| *t == Duration::from_secs(2)));
    }
}

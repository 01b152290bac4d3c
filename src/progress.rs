//! Per-run progress tracking and the observer interface.
//!
//! Each run (images, videos) owns exactly one [`ProgressTracker`]. Tasks
//! receive it as an explicit `Arc<ProgressTracker>` handle; every status
//! change goes through [`ProgressTracker::transition`], which validates the
//! change against the per-artifact state machine, updates the map, recomputes
//! `current`, and notifies observers, all under one lock. Concurrent tasks
//! therefore never lose updates, and observers never see a snapshot that
//! does not correspond to a real transition.
//!
//! ```text
//! pending ──▶ generating ──▶ complete
//!                 │  ▲           │
//!                 ▼  │           │ (regeneration)
//!              retrying          ▼
//!                 │         generating
//!                 ▼
//!               failed ──▶ generating (regeneration)
//! ```
//!
//! `current` is never incremented; it is recounted from the map after every
//! change, so regenerating an already-complete artifact cannot double-count.
//!
//! # Example
//!
//! ```rust
//! use pdf2flipbook::progress::{ProgressTracker, RunKind, StatusValue, NoopProgressObserver};
//! use std::sync::Arc;
//!
//! let tracker = ProgressTracker::new(RunKind::Images, Arc::new(NoopProgressObserver));
//! tracker.init(["cover".to_string(), "spread-1".to_string()]);
//! tracker.transition("cover", StatusValue::Generating).unwrap();
//! let snap = tracker.transition("cover", StatusValue::Complete).unwrap();
//! assert_eq!((snap.current, snap.total), (1, 2));
//! assert!(!snap.is_finished());
//! ```

use crate::error::FlipbookError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

/// Status of one artifact within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum StatusValue {
    Pending,
    Generating,
    /// A retryable failure happened; attempt `attempt + 1` of `max` is next.
    Retrying { attempt: u32, max: u32 },
    Complete,
    Failed,
}

impl StatusValue {
    /// Whether `self → to` is a legal edge of the state machine.
    pub fn can_become(&self, to: StatusValue) -> bool {
        use StatusValue::*;
        match to {
            Pending => false,
            Generating => matches!(self, Pending | Complete | Failed),
            Retrying { .. } => matches!(self, Generating | Retrying { .. }),
            Complete | Failed => matches!(self, Generating | Retrying { .. }),
        }
    }

    /// Complete or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusValue::Complete | StatusValue::Failed)
    }
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusValue::Pending => f.write_str("pending"),
            StatusValue::Generating => f.write_str("generating"),
            StatusValue::Retrying { attempt, max } => write!(f, "retrying ({attempt}/{max})"),
            StatusValue::Complete => f.write_str("complete"),
            StatusValue::Failed => f.write_str("failed"),
        }
    }
}

/// Which kind of run a tracker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Images,
    Videos,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Images => f.write_str("image"),
            RunKind::Videos => f.write_str("video"),
        }
    }
}

/// Immutable snapshot of a run's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    /// Number of keys whose status is `complete`.
    pub current: usize,
    /// Number of keys in the run. Fixed once the run is initialised.
    pub total: usize,
    pub status: BTreeMap<String, StatusValue>,
}

impl ProgressState {
    /// A run is finished when every one of its `total` keys is complete.
    ///
    /// Use this rather than `current == total`; it stays correct after
    /// partial regeneration.
    pub fn is_finished(&self) -> bool {
        self.total > 0
            && self.status.len() == self.total
            && self.status.values().all(|s| *s == StatusValue::Complete)
    }

    /// Keys currently marked `failed`.
    pub fn failed_keys(&self) -> Vec<String> {
        self.keys_with(|s| *s == StatusValue::Failed)
    }

    pub fn keys_with(&self, pred: impl Fn(&StatusValue) -> bool) -> Vec<String> {
        self.status
            .iter()
            .filter(|(_, s)| pred(s))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn recount(&mut self) {
        self.current = self
            .status
            .values()
            .filter(|s| **s == StatusValue::Complete)
            .count();
    }
}

/// Receives progress snapshots as a run advances.
///
/// Implementations must be `Send + Sync`: fan-out tasks report concurrently.
/// Calls happen while the tracker's lock is held, so each notification
/// corresponds to exactly one transition and arrives in transition order.
/// Keep implementations quick and never call back into the tracker.
pub trait ProgressObserver: Send + Sync {
    /// Called once when a run is initialised (all keys `pending`), or when a
    /// tracker is restored from stored artifacts.
    fn on_run_start(&self, run: RunKind, snapshot: &ProgressState) {
        let _ = (run, snapshot);
    }

    /// Called after every accepted transition.
    fn on_transition(&self, run: RunKind, key: &str, snapshot: &ProgressState) {
        let _ = (run, key, snapshot);
    }
}

/// A no-op observer for callers that only need the final result.
pub struct NoopProgressObserver;

impl ProgressObserver for NoopProgressObserver {}

/// Convenience alias for the shared observer handle.
pub type ProgressHandle = Arc<dyn ProgressObserver>;

/// Thread-safe owner of one run's [`ProgressState`].
pub struct ProgressTracker {
    run: RunKind,
    state: Mutex<ProgressState>,
    observer: ProgressHandle,
    updates: watch::Sender<ProgressState>,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("run", &self.run)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl ProgressTracker {
    /// An empty tracker. Call [`init`](Self::init) before transitions.
    pub fn new(run: RunKind, observer: ProgressHandle) -> Self {
        let (updates, _) = watch::channel(ProgressState::default());
        Self {
            run,
            state: Mutex::new(ProgressState::default()),
            observer,
            updates,
        }
    }

    /// Rebuild a tracker from what the store holds: keys in `complete` are
    /// `complete`, everything else `pending`.
    pub fn restore(
        run: RunKind,
        observer: ProgressHandle,
        keys: impl IntoIterator<Item = String>,
        complete: &BTreeSet<String>,
    ) -> Self {
        let tracker = Self::new(run, observer);
        {
            let mut state = tracker.lock();
            state.status = keys
                .into_iter()
                .map(|k| {
                    let status = if complete.contains(&k) {
                        StatusValue::Complete
                    } else {
                        StatusValue::Pending
                    };
                    (k, status)
                })
                .collect();
            state.total = state.status.len();
            state.recount();
            tracker.publish_start(&state);
        }
        tracker
    }

    pub fn run(&self) -> RunKind {
        self.run
    }

    /// Reset to `keys`, all `pending`, `current = 0`, `total = keys.len()`.
    pub fn init(&self, keys: impl IntoIterator<Item = String>) -> ProgressState {
        let mut state = self.lock();
        state.status = keys
            .into_iter()
            .map(|k| (k, StatusValue::Pending))
            .collect();
        state.total = state.status.len();
        state.current = 0;
        debug!("{} run initialised with {} items", self.run, state.total);
        self.publish_start(&state);
        state.clone()
    }

    /// Apply one status change and return the resulting snapshot.
    ///
    /// # Errors
    /// * [`FlipbookError::UnknownKey`] if `key` is not part of this run.
    /// * [`FlipbookError::InvalidTransition`] if the state machine forbids
    ///   the change (e.g. `complete → complete`, anything `→ pending`).
    pub fn transition(&self, key: &str, to: StatusValue) -> Result<ProgressState, FlipbookError> {
        let mut state = self.lock();
        let from = *state
            .status
            .get(key)
            .ok_or_else(|| FlipbookError::UnknownKey {
                key: key.to_string(),
                run: self.run.to_string(),
            })?;
        if !from.can_become(to) {
            return Err(FlipbookError::InvalidTransition {
                key: key.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        state.status.insert(key.to_string(), to);
        state.recount();
        debug!("{} {}: {} → {}", self.run, key, from, to);

        self.observer.on_transition(self.run, key, &state);
        self.updates.send_replace(state.clone());
        Ok(state.clone())
    }

    pub fn snapshot(&self) -> ProgressState {
        self.lock().clone()
    }

    pub fn status_of(&self, key: &str) -> Option<StatusValue> {
        self.lock().status.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().status.contains_key(key)
    }

    /// Stream of snapshots, starting with the current one.
    ///
    /// Intermediate snapshots may be skipped by slow consumers; the latest
    /// one is always delivered.
    pub fn subscribe(&self) -> WatchStream<ProgressState> {
        WatchStream::new(self.updates.subscribe())
    }

    fn publish_start(&self, state: &ProgressState) {
        self.observer.on_run_start(self.run, state);
        self.updates.send_replace(state.clone());
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        // A panicking observer must not wedge the whole run.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

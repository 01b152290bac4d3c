//! Bounded exponential backoff around a single provider call.
//!
//! Generation APIs fail constantly under load: 5xx from an overloaded
//! backend, connection resets, jobs that die mid-render. Most of those
//! succeed on a second try. Some never will: a revoked key, an exhausted
//! quota, a payload the model refuses. [`RetryPolicy::execute`] retries the
//! first kind and gives up immediately on the second.
//!
//! With the default base of 2 and a one-second unit the waits are
//! 2 s → 4 s → 8 s …, i.e. `base ^ attempt` seconds after the `attempt`-th
//! failure.

use crate::error::{AttemptError, GenerationError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::{error, warn};

/// Message fragments that mark a failure as permanent.
const PERMANENT_MARKERS: &[&str] = &[
    "401",
    "403",
    "api key",
    "quota",
    "invalid",
    "not configured",
];

/// Whether an error message describes a failure no retry can fix.
///
/// Case-insensitive substring match on auth codes, credentials, quota and
/// malformed-input wording.
pub fn is_permanent_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    PERMANENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// How many times to try, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. Always ≥ 1.
    pub max_attempts: u32,
    /// Exponential base. Default: 2.
    pub backoff_base: u32,
    /// Length of one backoff unit in milliseconds. Default: 1000.
    pub backoff_unit_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2,
            backoff_unit_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Wait inserted after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.backoff_base).saturating_pow(attempt);
        Duration::from_millis(self.backoff_unit_ms.saturating_mul(factor))
    }

    /// Run `action` until it succeeds, fails permanently, or runs out of
    /// attempts.
    ///
    /// * `is_permanent` decides whether a failure should stop the loop.
    /// * `on_retry(attempt, max_attempts)` fires after a retryable failure,
    ///   right before the backoff sleep, so the tracker can show
    ///   `retrying (n/max)`.
    ///
    /// The returned [`AttemptError`] carries the number of calls actually
    /// made: 1 for an immediate permanent failure, `max_attempts` when the
    /// budget is exhausted.
    pub async fn execute<T, F, Fut, C, R>(
        &self,
        is_permanent: C,
        mut action: F,
        mut on_retry: R,
    ) -> Result<T, AttemptError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
        C: Fn(&GenerationError) -> bool,
        R: FnMut(u32, u32),
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match action(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if is_permanent(&e) => {
                    error!("Permanent error on attempt {}, not retrying: {}", attempt, e);
                    return Err(AttemptError { attempts: attempt, error: e });
                }
                Err(e) if attempt >= max => {
                    error!("All {} attempts failed: {}", max, e);
                    return Err(AttemptError { attempts: attempt, error: e });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Attempt {}/{} failed, retrying in {}ms: {}",
                        attempt,
                        max,
                        delay.as_millis(),
                        e
                    );
                    on_retry(attempt, max);
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// [`RetryPolicy::execute`] with the standard classification
/// ([`GenerationError::is_permanent`]).
pub async fn execute_with_retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    action: F,
    on_retry: R,
) -> Result<T, AttemptError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
    R: FnMut(u32, u32),
{
    policy
        .execute(GenerationError::is_permanent, action, on_retry)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn transient(msg: &str) -> GenerationError {
        GenerationError::Transient {
            provider: "test".into(),
            status: None,
            message: msg.into(),
        }
    }

    #[test]
    fn permanent_markers() {
        assert!(is_permanent_message("Replicate API error: 401 - Unauthenticated"));
        assert!(is_permanent_message("HTTP 403 Forbidden"));
        assert!(is_permanent_message("Missing API KEY"));
        assert!(is_permanent_message("Quota exceeded for project"));
        assert!(is_permanent_message("INVALID_ARGUMENT: image too large"));
        assert!(is_permanent_message("Replicate is not configured"));
        assert!(!is_permanent_message("connection reset by peer"));
        assert!(!is_permanent_message("503 Service Unavailable"));
    }

    #[test]
    fn delays_follow_powers_of_base() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
        assert_eq!(p.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_saturates_instead_of_overflowing() {
        let p = RetryPolicy {
            max_attempts: 100,
            backoff_base: 10,
            backoff_unit_ms: u64::MAX,
        };
        assert_eq!(p.delay_for(90), Duration::from_millis(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_attempted_once() {
        let calls = AtomicU32::new(0);
        let retries = AtomicU32::new(0);
        let result: Result<(), _> = execute_with_retry(
            &RetryPolicy::default(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GenerationError::from_message(
                        "replicate",
                        Some(401),
                        "401 - Unauthenticated",
                    ))
                }
            },
            |_, _| {
                retries.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_exhausts_budget_with_exponential_waits() {
        let attempt_times = Mutex::new(Vec::new());
        let retry_events = Mutex::new(Vec::new());
        let start = Instant::now();

        let result: Result<(), _> = execute_with_retry(
            &RetryPolicy::default(),
            |_| {
                attempt_times.lock().unwrap().push(start.elapsed());
                async { Err(transient("connection reset")) }
            },
            |attempt, max| retry_events.lock().unwrap().push((attempt, max)),
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(
            *attempt_times.lock().unwrap(),
            vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(6),
            ]
        );
        assert_eq!(*retry_events.lock().unwrap(), vec![(1, 3), (2, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let value = execute_with_retry(
            &RetryPolicy::default(),
            |attempt| async move {
                if attempt < 3 {
                    Err(transient("timeout"))
                } else {
                    Ok(attempt)
                }
            },
            |_, _| {},
        )
        .await;
        assert_eq!(value.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier_is_honoured() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .execute(
                |_| true,
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(transient("would normally retry")) }
                },
                |_, _| {},
            )
            .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        let result: Result<u32, _> =
            execute_with_retry(&policy, |a| async move { Ok(a) }, |_, _| {}).await;
        assert_eq!(result.unwrap(), 1);
    }
}

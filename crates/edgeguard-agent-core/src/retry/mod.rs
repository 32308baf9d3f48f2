//! Exponential backoff retry with jitter and cooperative cancellation.
//!
//! This is the single retry implementation in the agent. The bootstrap
//! client, the delivery pipeline, and idempotent authenticated GETs all
//! parameterize it instead of rolling their own loops.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Jitter fraction applied to each computed delay, e.g. `0.25` for
    /// a uniform ±25% variation. Zero disables jitter.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Defaults used for bootstrap and other control-plane calls:
    /// 5s initial, doubling, capped at 5 minutes, 10 attempts, ±25% jitter.
    #[must_use]
    pub fn control_plane() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5 * 60),
            max_attempts: 10,
            jitter: 0.25,
        }
    }

    /// Defaults used for telemetry delivery: 1s base doubling each attempt
    /// (1, 2, 4, 8, 16s), 5 attempts, no jitter.
    #[must_use]
    pub fn delivery() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(16),
            max_attempts: 5,
            jitter: 0.0,
        }
    }

    /// Delay before the attempt following `attempt` (zero-based).
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Outcome of a retried operation.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The cancellation token fired between attempts. No further attempt
    /// was made.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation failed with an error classified as non-retryable.
    #[error("permanent error: {0}")]
    Permanent(E),

    /// Every attempt failed with a transient error.
    #[error("all {attempts} attempts failed: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Permanent(e) | RetryError::Exhausted { last: e, .. } => Some(e),
        }
    }
}

/// Runs `op` with exponential backoff until it succeeds, fails permanently
/// (per `retryable`), exhausts `max_attempts`, or `cancel` fires.
///
/// Cancellation is checked while waiting between attempts: a cancelled
/// token aborts the wait and returns [`RetryError::Cancelled`] without a
/// further attempt.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    retryable: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut last_err = None;

    for attempt in 0..policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => return Err(RetryError::Permanent(e)),
            Err(e) => {
                debug!("attempt {}/{} failed: {}", attempt + 1, policy.max_attempts, e);
                last_err = Some(e);
            }
        }

        // No wait after the final attempt.
        if attempt + 1 < policy.max_attempts {
            let delay = policy.delay_for(attempt);
            tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    match last_err {
        Some(last) => Err(RetryError::Exhausted {
            attempts: policy.max_attempts,
            last,
        }),
        // max_attempts == 0 never runs the operation.
        None => Err(RetryError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(20),
            max_attempts,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let calls_clone = Arc::clone(&calls);
        let result = retry_with_backoff(
            &fast_policy(5),
            &cancel,
            |_| true,
            move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.expect("should succeed"), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let calls_clone = Arc::clone(&calls);
        let result: Result<(), _> = retry_with_backoff(
            &fast_policy(5),
            &cancel,
            |e: &&str| *e != "permanent",
            move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("permanent")
                }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let calls_clone = Arc::clone(&calls);
        let result: Result<(), _> = retry_with_backoff(
            &fast_policy(3),
            &cancel,
            |_| true,
            move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("down")
                }
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_between_attempts() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(30),
            ..fast_policy(5)
        };

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let result: Result<(), _> =
            retry_with_backoff(&policy, &cancel, |_| true, || async { Err("down") }).await;

        // The cancellation error wins over the underlying transient error.
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn test_no_attempt_after_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: Result<(), _> = retry_with_backoff(
            &fast_policy(5),
            &cancel,
            |_| true,
            move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("down")
                }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delay_progression_and_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(16),
            max_attempts: 8,
            jitter: 0.0,
        };

        let delays: Vec<u64> = (0..6).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 16]);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(4),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
            jitter: 0.25,
        };

        for _ in 0..100 {
            let d = policy.delay_for(0).as_secs_f64();
            assert!((3.0..=5.0).contains(&d), "delay {d} outside ±25% of 4s");
        }
    }
}

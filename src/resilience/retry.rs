//! Retry executor with exponential backoff and jitter.
//!
//! The decision to retry is driven by [`ErrorClass`]:
//! - `Transient`: back off and try again until `max_attempts` is spent.
//! - `Recoverable`: run the refresh hook (if any) once, then one more attempt.
//! - `Fatal`: give up immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Classify, ErrorClass};

/// Backoff parameters for one kind of external call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the computed delay added at random, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Same backoff, but at most one retry.
    pub fn single_retry(&self) -> Self {
        Self {
            max_attempts: self.max_attempts.min(2),
            ..self.clone()
        }
    }

    /// Deterministic part of the wait before retry number `retry` (0-based):
    /// `min(base_delay * multiplier^retry, max_delay)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn jittered_delay(&self, retry: u32) -> Duration {
        let delay = self.delay_for(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=jitter);
        delay + delay.mul_f64(extra)
    }
}

/// Why the executor stopped retrying.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The error was classified as fatal; no retry was made.
    #[error("{0}")]
    Fatal(E),

    /// Every allowed attempt failed.
    #[error("exhausted retries after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn last(&self) -> &E {
        match self {
            Self::Fatal(e) => e,
            Self::Exhausted { last, .. } => last,
        }
    }
}

/// Run `op` under `policy` without a refresh hook.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    execute(
        policy,
        label,
        op,
        None::<fn() -> std::future::Ready<Result<(), E>>>,
    )
    .await
}

/// Run `op` under `policy`. On the first `Recoverable` failure `refresh` is
/// awaited before the next attempt; the refreshed attempt counts against
/// `max_attempts`. A failing refresh ends the call as `Fatal`.
pub async fn retry_with_refresh<T, E, F, Fut, R, RFut>(
    policy: &RetryPolicy,
    label: &str,
    op: F,
    refresh: R,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<(), E>>,
    E: Classify + Display,
{
    execute(policy, label, op, Some(refresh)).await
}

async fn execute<T, E, F, Fut, R, RFut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
    mut refresh: Option<R>,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<(), E>>,
    E: Classify + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut recovered = false;

    loop {
        attempt += 1;
        if attempt > 1 {
            tracing::debug!(operation = label, attempt, "Retrying");
        }

        let err = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation = label, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        match err.class() {
            ErrorClass::Fatal => {
                tracing::warn!(operation = label, attempt, error = %err, "Fatal error, not retrying");
                return Err(RetryError::Fatal(err));
            }
            ErrorClass::Recoverable if recovered => {
                tracing::warn!(operation = label, attempt, error = %err, "Still failing after refresh");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            ErrorClass::Recoverable => {
                recovered = true;
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                if let Some(hook) = refresh.take() {
                    tracing::info!(operation = label, error = %err, "Refreshing before retry");
                    if let Err(refresh_err) = hook().await {
                        tracing::warn!(operation = label, error = %refresh_err, "Refresh failed");
                        return Err(RetryError::Fatal(refresh_err));
                    }
                }
            }
            ErrorClass::Transient => {
                if attempt >= max_attempts {
                    tracing::warn!(
                        operation = label,
                        attempts = attempt,
                        error = %err,
                        "Giving up after max attempts"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
            }
        }

        let delay = policy.jittered_delay(attempt - 1);
        tracing::warn!(
            operation = label,
            attempt,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "Call failed, will retry after backoff"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::SourceError;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(250),
            jitter: 0.0,
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(250));
        assert_eq!(p.delay_for(30), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..policy()
        };
        for _ in 0..50 {
            let d = p.jittered_delay(0);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn single_retry_caps_attempts() {
        assert_eq!(policy().single_retry().max_attempts, 2);
        let one = RetryPolicy {
            max_attempts: 1,
            ..policy()
        };
        assert_eq!(one.single_retry().max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&policy(), "fetch", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SourceError::transient("s", "connection reset")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last.message, "connection reset");
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_second_attempt_stops_retrying() {
        let calls = AtomicU32::new(0);
        let result = retry(&policy(), "fetch", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(SourceError::transient("s", "timeout"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts() {
        let start = tokio::time::Instant::now();
        let _: Result<(), _> = retry(&policy(), "fetch", || async {
            Err(SourceError::transient("s", "timeout"))
        })
        .await;
        // 100ms after the first failure, 200ms after the second.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&policy(), "fetch", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SourceError::fatal("s", "file not found")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result.unwrap_err(), RetryError::Fatal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_error_refreshes_once_then_retries() {
        let calls = AtomicU32::new(0);
        let refreshes = Arc::new(AtomicU32::new(0));
        let hook_counter = refreshes.clone();

        let result = retry_with_refresh(
            &policy(),
            "fetch",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(SourceError::recoverable("s", "token expired"))
                    } else {
                        Ok("items")
                    }
                }
            },
            move || async move {
                hook_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert_eq!(result.unwrap(), "items");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_error_gets_only_one_more_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_refresh(
            &RetryPolicy {
                max_attempts: 5,
                ..policy()
            },
            "fetch",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SourceError::recoverable("s", "quota exceeded")) }
            },
            || async { Ok(()) },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_refresh_is_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_refresh(
            &policy(),
            "fetch",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SourceError::recoverable("s", "token expired")) }
            },
            || async { Err(SourceError::fatal("s", "refresh token revoked")) },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result {
            Err(RetryError::Fatal(e)) => assert_eq!(e.message, "refresh token revoked"),
            other => panic!("Expected Fatal, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_never_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            &RetryPolicy {
                max_attempts: 1,
                ..policy()
            },
            "fetch",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SourceError::recoverable("s", "quota")) }
            },
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
    }
}

//! Retry logic with exponential backoff for remote calls.
//!
//! Retries only failures the policy lists as retryable. Everything else,
//! including errors that did not come from the remote at all, is returned
//! after the first attempt.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::failure::{AttemptTimeout, Classify, FailureKind};

/// Retry configuration attached to a call site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub base_delay: Duration,
    /// Upper bound for the exponential delay, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Fraction of the delay used as random jitter (0.0 disables it).
    pub jitter: f64,
    /// Timeout applied to each individual attempt, in milliseconds.
    #[serde(with = "crate::serde_millis::option")]
    pub attempt_timeout: Option<Duration>,
    /// Failure kinds worth another attempt.
    pub retry_on: Vec<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.2,
            attempt_timeout: Some(Duration::from_secs(30)),
            retry_on: vec![FailureKind::Network, FailureKind::Timeout],
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_retry_on(mut self, kinds: Vec<FailureKind>) -> Self {
        self.retry_on = kinds;
        self
    }

    /// Whether an error deserves another attempt under this policy.
    pub fn is_retryable<E: Classify>(&self, error: &E) -> bool {
        error
            .failure_kind()
            .is_some_and(|kind| self.retry_on.contains(&kind))
    }

    /// Attempts actually made, never less than one.
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retrying after `failed_attempt` (1-based) failed, without jitter.
    ///
    /// `base_delay * multiplier^(failed_attempt - 1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let raw = self.base_delay.as_secs_f64() * factor;
        if !raw.is_finite() || raw >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        self.base_delay.mul_f64(factor)
    }

    /// Backoff delay with jitter applied.
    ///
    /// The jitter is uniformly distributed in `±jitter * delay`.
    pub fn jittered_delay(&self, failed_attempt: u32) -> Duration {
        let delay = self.backoff_delay(failed_attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = (fastrand::f64() * 2.0 - 1.0) * jitter;
        Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
    }
}

/// Result of a retried operation.
#[derive(Debug, Clone)]
pub struct RetryResult<T, E> {
    /// The final result (success or last error).
    pub result: Result<T, E>,
    /// Number of attempts made (1 = first try settled it).
    pub attempts: u32,
    /// Total time spent, including backoff sleeps.
    pub total_duration: Duration,
}

impl<T, E> RetryResult<T, E> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Run `operation` under `policy`.
///
/// The closure receives the 1-based attempt number. Each attempt is bounded by
/// `policy.attempt_timeout` when set; an elapsed attempt becomes an `E` built
/// from [`AttemptTimeout`] and is retried like any other timeout.
pub async fn execute_with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + From<AttemptTimeout> + Display,
{
    let start = Instant::now();
    let max_attempts = policy.effective_attempts();
    let mut attempt = 1;

    loop {
        let outcome = match policy.attempt_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, operation(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(E::from(AttemptTimeout { attempt, timeout })),
            },
            None => operation(attempt).await,
        };

        let error = match outcome {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts: attempt,
                    total_duration: start.elapsed(),
                };
            }
            Err(error) => error,
        };

        if !policy.is_retryable(&error) || attempt >= max_attempts {
            tracing::debug!(attempt, max_attempts, error = %error, "giving up");
            return RetryResult {
                result: Err(error),
                attempts: attempt,
                total_duration: start.elapsed(),
            };
        }

        let delay = policy.jittered_delay(attempt);
        tracing::debug!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying after failure"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::RemoteError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(0.0)
    }

    #[derive(Debug)]
    struct NotRemote;

    impl Display for NotRemote {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "circuit open")
        }
    }

    impl Classify for NotRemote {
        fn failure_kind(&self) -> Option<FailureKind> {
            None
        }
    }

    impl From<AttemptTimeout> for NotRemote {
        fn from(_: AttemptTimeout) -> Self {
            NotRemote
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_eventually() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry(&fast_policy(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(RemoteError::network("connection reset"))
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert!(result.succeeded());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.into_result().unwrap(), "success");
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_uses_every_attempt() {
        let calls = AtomicU32::new(0);
        let result: RetryResult<(), RemoteError> =
            execute_with_retry(&fast_policy().with_max_attempts(3), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RemoteError::timeout("no answer")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.result.unwrap_err().kind, FailureKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_is_attempted_once() {
        let calls = AtomicU32::new(0);
        let result: RetryResult<(), RemoteError> = execute_with_retry(&fast_policy(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::rejected("invalid folder")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unclassified_errors_are_never_retried() {
        let calls = AtomicU32::new(0);
        let result: RetryResult<(), NotRemote> = execute_with_retry(&fast_policy(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(NotRemote) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!result.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_attempt_times_out_and_is_retried() {
        let policy = fast_policy()
            .with_max_attempts(2)
            .with_attempt_timeout(Some(Duration::from_millis(50)));
        let calls = AtomicU32::new(0);

        let result: RetryResult<&str, RemoteError> = execute_with_retry(&policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok("late but fine")
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.into_result().unwrap(), "late but fine");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_between_attempts() {
        let policy = RetryPolicy::default()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(0.0);
        let start = Instant::now();

        let result: RetryResult<(), RemoteError> =
            execute_with_retry(&policy, |_| async { Err(RemoteError::network("down")) }).await;

        // 100ms after the first failure, 200ms after the second.
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(300), "{waited:?}");
        assert!(waited < Duration::from_millis(310), "{waited:?}");
        assert!(result.total_duration >= Duration::from_millis(300));
    }

    #[test]
    fn backoff_delay_grows_and_caps() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .with_backoff_multiplier(2.0);

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(1000))
            .with_jitter(0.25);
        for _ in 0..200 {
            let d = policy.jittered_delay(1);
            assert!(d >= Duration::from_millis(750), "{d:?}");
            assert!(d <= Duration::from_millis(1250), "{d:?}");
        }
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).effective_attempts(), 1);
    }
}

//! Bounded retry with configurable backoff and jitter.
//!
//! Every externally backed step operation runs through [`execute_with_retry`].
//! A classifier decides per error whether another attempt is worth making;
//! fatal errors surface after the first attempt.

use crate::cancellation::CancellationToken;
use crate::errors::RetryClass;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to spread out retries from concurrent callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Retry policy for step operations.
///
/// The default makes 4 attempts with 1s, 2s and 4s between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Sum of the un-jittered delays when every attempt fails.
    #[must_use]
    pub fn total_backoff(&self) -> Duration {
        let mut state = RetryState {
            attempts: 1,
            previous_delay_ms: None,
        };
        let mut total = Duration::ZERO;
        while state.attempts < self.max_attempts {
            total += state.base_delay(self);
            state.attempts += 1;
        }
        total
    }
}

/// Progress of one retried operation.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempts: u32,
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the policy allows another attempt.
    #[must_use]
    pub fn can_retry(&self, policy: &RetryPolicy) -> bool {
        self.attempts < policy.max_attempts
    }

    fn base_delay(&self, policy: &RetryPolicy) -> Duration {
        let retry = self.attempts.saturating_sub(1);
        let base = policy.base_delay_ms;
        let delay = match policy.backoff {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1),
            BackoffStrategy::Constant => base,
        };
        Duration::from_millis(delay.min(policy.max_delay_ms))
    }

    /// Calculates the delay before the next attempt, after `attempts` failures.
    #[must_use]
    pub fn next_delay(&mut self, policy: &RetryPolicy) -> Duration {
        let delay = u64::try_from(self.base_delay(policy).as_millis()).unwrap_or(u64::MAX);
        let base = policy.base_delay_ms;
        let max = policy.max_delay_ms;

        let jittered = match policy.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                if upper <= base {
                    base.min(max)
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                }
            }
        };

        self.previous_delay_ms = Some(jittered);
        Duration::from_millis(jittered)
    }
}

/// A successful result and the attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T> {
    /// The operation's result.
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The classifier marked the error as not worth retrying.
    #[error("{error}")]
    Fatal {
        /// The error of the last attempt.
        error: E,
        /// Attempts made.
        attempts: u32,
    },

    /// Every allowed attempt failed.
    #[error("{error} (after {attempts} attempts)")]
    Exhausted {
        /// The error of the last attempt.
        error: E,
        /// Attempts made.
        attempts: u32,
    },

    /// Cancellation was requested between attempts.
    #[error("cancelled after {attempts} attempts: {reason}")]
    Cancelled {
        /// The cancellation reason.
        reason: String,
        /// The error of the last attempt, if one was made.
        last_error: Option<E>,
        /// Attempts made.
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// Returns the number of attempts made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Returns the last operation error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Fatal { error, .. } | Self::Exhausted { error, .. } => Some(error),
            Self::Cancelled { last_error, .. } => last_error.as_ref(),
        }
    }
}

/// Runs an operation under the policy.
///
/// # Errors
///
/// Returns [`RetryError::Fatal`] or [`RetryError::Exhausted`] with the last
/// error when the operation does not succeed.
pub async fn with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    operation: F,
) -> Result<RetryOutcome<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryClass,
    E: std::fmt::Display,
{
    execute_with_retry(policy, classify, None, |_, _, _| {}, operation).await
}

/// Runs an operation under the policy, stopping early on cancellation.
///
/// The token is checked before each attempt and raced against backoff
/// sleeps. A running attempt is not interrupted.
///
/// # Errors
///
/// As [`with_retry`], plus [`RetryError::Cancelled`].
pub async fn with_retry_cancellable<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    token: &CancellationToken,
    operation: F,
) -> Result<RetryOutcome<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryClass,
    E: std::fmt::Display,
{
    execute_with_retry(policy, classify, Some(token), |_, _, _| {}, operation).await
}

/// Runs an operation under the policy with full control.
///
/// `on_retry(failed_attempt, delay, error)` is called before each backoff sleep.
///
/// # Errors
///
/// As [`with_retry_cancellable`].
pub async fn execute_with_retry<T, E, F, Fut, C, R>(
    policy: &RetryPolicy,
    classify: C,
    token: Option<&CancellationToken>,
    mut on_retry: R,
    mut operation: F,
) -> Result<RetryOutcome<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryClass,
    R: FnMut(u32, Duration, &E),
    E: std::fmt::Display,
{
    let mut state = RetryState::new();
    let mut last_error = None;

    loop {
        if let Some(reason) = token.and_then(cancellation_reason) {
            return Err(RetryError::Cancelled {
                reason,
                last_error,
                attempts: state.attempts,
            });
        }

        state.attempts += 1;
        let error = match operation().await {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    attempts: state.attempts,
                })
            }
            Err(error) => error,
        };

        if classify(&error) == RetryClass::Fatal {
            tracing::debug!(attempt = state.attempts, error = %error, "Not retrying fatal error");
            return Err(RetryError::Fatal {
                error,
                attempts: state.attempts,
            });
        }
        if !state.can_retry(policy) {
            tracing::debug!(attempts = state.attempts, error = %error, "Retries exhausted");
            return Err(RetryError::Exhausted {
                error,
                attempts: state.attempts,
            });
        }

        let delay = state.next_delay(policy);
        tracing::debug!(
            attempt = state.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Retrying after error"
        );
        on_retry(state.attempts, delay, &error);
        last_error = Some(error);

        match token {
            Some(token) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = token.cancelled() => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}

fn cancellation_reason(token: &CancellationToken) -> Option<String> {
    token
        .is_cancelled()
        .then(|| token.reason().unwrap_or_else(|| "cancelled".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn classify(err: &ProviderError) -> RetryClass {
        err.retry_class()
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.backoff, BackoffStrategy::Exponential);
        assert_eq!(policy.jitter, JitterStrategy::None);
        assert_eq!(policy.total_backoff(), Duration::from_secs(7));
    }

    #[test]
    fn test_retry_policy_from_partial_json() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 2, "jitter": "full"}"#).unwrap();

        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.jitter, JitterStrategy::Full);
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::new();
        let mut state = RetryState::new();

        let delays: Vec<Duration> = (1..=3)
            .map(|attempts| {
                state.attempts = attempts;
                state.next_delay(&policy)
            })
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn test_linear_and_constant_delays() {
        let linear = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear);
        let constant = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        let mut state = RetryState::new();
        state.attempts = 3;

        assert_eq!(state.next_delay(&linear), Duration::from_millis(300));
        assert_eq!(state.next_delay(&constant), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::new().with_max_delay_ms(5000);
        let mut state = RetryState::new();
        state.attempts = 11;

        assert_eq!(state.next_delay(&policy), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_stays_below_delay() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::Full);
        let mut state = RetryState::new();
        state.attempts = 1;

        for _ in 0..10 {
            assert!(state.next_delay(&policy) <= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retriable_errors_exhaust_after_backoff() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<RetryOutcome<()>, _> = with_retry(&RetryPolicy::new(), classify, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::rate_limited("429")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_secs(7));
        match result {
            Err(RetryError::Exhausted { error, attempts }) => {
                assert_eq!(attempts, 4);
                assert_eq!(error, ProviderError::rate_limited("429"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<RetryOutcome<()>, _> = with_retry(&RetryPolicy::new(), classify, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::malformed("not json")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(matches!(result, Err(RetryError::Fatal { attempts: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let result = with_retry(&RetryPolicy::new(), classify, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(ProviderError::timeout("60s"))
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_retry_sees_each_backoff() {
        let mut seen = Vec::new();

        let _ = execute_with_retry(
            &RetryPolicy::new().with_max_attempts(3),
            classify,
            None,
            |attempt, delay, _err: &ProviderError| seen.push((attempt, delay)),
            || async { Err::<(), _>(ProviderError::timeout("slow")) },
        )
        .await;

        assert_eq!(
            seen,
            vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_between_attempts() {
        let token = Arc::new(CancellationToken::new());
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<RetryOutcome<()>, _> = {
            let token_in_op = token.clone();
            let calls = calls.clone();
            with_retry_cancellable(&RetryPolicy::new(), classify, &token, move || {
                calls.fetch_add(1, Ordering::SeqCst);
                token_in_op.cancel("shutting down");
                async { Err(ProviderError::timeout("slow")) }
            })
            .await
        };

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result {
            Err(RetryError::Cancelled {
                reason,
                last_error,
                attempts,
            }) => {
                assert_eq!(reason, "shutting down");
                assert_eq!(attempts, 1);
                assert_eq!(last_error, Some(ProviderError::timeout("slow")));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel("never started");

        let result: Result<RetryOutcome<()>, RetryError<ProviderError>> =
            with_retry_cancellable(&RetryPolicy::new(), classify, &token, || async {
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Cancelled { attempts: 0, last_error: None, .. })
        ));
    }
}

//! Bounded retry with jittered exponential backoff for remote model calls.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;

pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Source of backoff delays. Swapped out in tests to observe delays without waiting.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration) -> SleepFuture;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, delay: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(delay))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Upper bound for a single remote call; elapsing counts as a transient failure.
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
            call_timeout: None,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// Doubles from `base_delay` per attempt, adds up to 50% random jitter when enabled,
    /// and never exceeds `max_delay`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exp = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        if !self.jitter || exp.is_zero() {
            return exp;
        }
        let half_ms = u64::try_from(exp.as_millis() / 2).unwrap_or(u64::MAX);
        let extra = rand::thread_rng().gen_range(0..=half_ms);
        (exp + Duration::from_millis(extra)).min(self.max_delay)
    }
}

/// A call that did not succeed within the policy.
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempt(s): {source}")]
pub struct Exhausted {
    pub attempts: u32,
    pub source: LlmError,
}

impl Exhausted {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, LlmError::Cancelled)
    }
}

#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for Retrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrier")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Retrier {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` until it succeeds, fails permanently, runs out of attempts, or
    /// `cancel` fires.
    ///
    /// Cancellation is observed before each attempt and during backoff; a call that
    /// is already in flight is allowed to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Exhausted`] carrying the attempt count and the last error. A
    /// non-transient error is returned after the attempt that produced it.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, Exhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Exhausted {
                    attempts: attempt,
                    source: LlmError::Cancelled,
                });
            }
            attempt += 1;

            let result = match self.policy.call_timeout {
                Some(limit) => tokio::time::timeout(limit, call())
                    .await
                    .unwrap_or_else(|_| Err(LlmError::Timeout(limit))),
                None => call().await,
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }
            if attempt >= max_attempts {
                tracing::warn!(operation, attempts = attempt, error = %err, "retries exhausted");
                return Err(Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = err
                .retry_after()
                .map_or_else(|| self.policy.backoff(attempt), |d| d.min(self.policy.max_delay));
            tracing::warn!(
                operation,
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "transient failure, backing off"
            );
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(Exhausted {
                        attempts: attempt,
                        source: LlmError::Cancelled,
                    });
                }
                () = self.sleeper.sleep(delay) => {}
            }
        }
    }
}

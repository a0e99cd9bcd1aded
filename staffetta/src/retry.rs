//! Attempt orchestration: retry policy, deterministic backoff and the
//! shared retry token bucket.

use crate::{CallError, ConfigError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use tonic::Code;

// Tokens are tracked in thousandths so that fractional token ratios stay
// exact enough under atomic arithmetic.
const TOKEN_SCALE: u64 = 1000;

/// Decides which failed attempts are worth retrying and how long to wait
/// before each retry. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_multiplier: f64,
    retryable_codes: Vec<Code>,
}

impl RetryPolicy {
    /// Validate and construct a policy.
    ///
    /// The multiplier must be at least 1: backoff delays are required to be
    /// non-decreasing from one attempt to the next.
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
        retryable_codes: impl IntoIterator<Item = Code>,
    ) -> Result<Self, ConfigError> {
        if max_attempts < 1 {
            return Err(ConfigError::InvalidMaxAttempts(max_attempts));
        }
        if initial_backoff.is_zero() {
            return Err(ConfigError::ZeroInitialBackoff);
        }
        if max_backoff < initial_backoff {
            return Err(ConfigError::BackoffRange {
                initial: initial_backoff,
                max: max_backoff,
            });
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(backoff_multiplier));
        }

        Ok(Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            retryable_codes: retryable_codes.into_iter().collect(),
        })
    }

    /// A policy that never retries: one attempt, nothing retryable.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            retryable_codes: Vec::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, code: Code) -> bool {
        self.retryable_codes.contains(&code)
    }

    /// The delay inserted after failed attempt `attempt` (1-based):
    /// `min(initial_backoff * multiplier^(attempt - 1), max_backoff)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        let capped = delay.min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
    }
}

/// Caps aggregate retry volume across all calls sharing the bucket.
///
/// Every admitted retry withdraws one token; every success deposits
/// `token_ratio` tokens back, up to `max_tokens`. While less than one
/// whole token remains, retries are suppressed and calls fail fast with
/// [`CallError::RetryBudgetExhausted`], which bounds retry storms during
/// widespread outages.
#[derive(Debug)]
pub struct RetryThrottle {
    available: AtomicU64,
    capacity: u64,
    refill: u64,
}

impl RetryThrottle {
    pub fn new(max_tokens: u32, token_ratio: f64) -> Result<Self, ConfigError> {
        if max_tokens == 0 || max_tokens > 1000 {
            return Err(ConfigError::InvalidMaxTokens(max_tokens));
        }
        if !token_ratio.is_finite() || token_ratio <= 0.0 || token_ratio > 1.0 {
            return Err(ConfigError::InvalidTokenRatio(token_ratio));
        }

        let capacity = u64::from(max_tokens) * TOKEN_SCALE;
        let refill = ((token_ratio * TOKEN_SCALE as f64).round() as u64).max(1);

        Ok(Self {
            available: AtomicU64::new(capacity),
            capacity,
            refill,
        })
    }

    /// Withdraw one token, or report that the bucket is empty.
    pub fn try_withdraw(&self) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                tokens.checked_sub(TOKEN_SCALE)
            })
            .is_ok()
    }

    /// Deposit `token_ratio` tokens after a successful attempt.
    pub fn deposit(&self) {
        let _ = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                Some((tokens + self.refill).min(self.capacity))
            });
    }

    /// The number of whole and fractional tokens currently available.
    pub fn tokens(&self) -> f64 {
        self.available.load(Ordering::Acquire) as f64 / TOKEN_SCALE as f64
    }
}

/// One attempt's failure, as seen by the retry engine.
#[derive(Debug)]
pub enum AttemptError {
    /// The attempt failed with a gRPC status; retryable if the policy says
    /// so.
    Status(tonic::Status),
    /// The attempt failed in a way no retry can fix (no healthy endpoint,
    /// oversized response). Surfaced to the caller immediately.
    Terminal(CallError),
}

/// Drives the attempts of one logical call: dispatch, classify, back off,
/// repeat.
///
/// Attempts are strictly sequential; the engine suspends the calling task
/// during backoff, so cancelling the enclosing future also cancels any
/// pending delay.
pub struct RetryEngine {
    policy: RetryPolicy,
    throttle: Option<Arc<RetryThrottle>>,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy, throttle: Option<Arc<RetryThrottle>>) -> Self {
        Self { policy, throttle }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` (receiving the 1-based attempt number) until it
    /// succeeds, fails terminally, or the policy gives up.
    ///
    /// The last attempt's error is always the one reported.
    pub async fn execute<T, F, Fut>(&self, mut attempt: F) -> Result<T, CallError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut attempts = 1;

        loop {
            match attempt(attempts).await {
                Ok(value) => {
                    if let Some(throttle) = &self.throttle {
                        throttle.deposit();
                    }
                    return Ok(value);
                }
                Err(AttemptError::Terminal(error)) => return Err(error),
                Err(AttemptError::Status(status)) => {
                    if !self.policy.is_retryable(status.code()) {
                        tracing::debug!(
                            attempt = attempts,
                            code = ?status.code(),
                            "status is not retryable",
                        );
                        return Err(CallError::Rpc(status));
                    }
                    if attempts >= self.policy.max_attempts() {
                        tracing::debug!(
                            attempt = attempts,
                            code = ?status.code(),
                            "attempt budget exhausted",
                        );
                        return Err(CallError::Rpc(status));
                    }
                    if let Some(throttle) = &self.throttle {
                        if !throttle.try_withdraw() {
                            tracing::warn!(
                                attempt = attempts,
                                code = ?status.code(),
                                "retry budget exhausted; failing fast",
                            );
                            return Err(CallError::RetryBudgetExhausted { last: status });
                        }
                    }

                    let delay = self.policy.backoff(attempts);
                    tracing::debug!(
                        attempt = attempts,
                        code = ?status.code(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying after backoff",
                    );
                    tokio::time::sleep(delay).await;
                    attempts += 1;
                }
            }
        }
    }
}

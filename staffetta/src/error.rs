//! Error types surfaced by the call path and by configuration validation.

use crate::ServiceName;
use std::time::Duration;
use thiserror::Error;

/// The ways a single logical call through a
/// [`BalancedClient`](crate::BalancedClient) can fail.
///
/// Transient discovery failures never show up here: the endpoint registry
/// retries those internally and callers keep operating on the last known
/// endpoint set.
#[derive(Debug, Error)]
pub enum CallError {
    /// The healthy endpoint set was empty at selection time. Terminal for
    /// this call; attempts are not burned waiting for capacity to appear
    /// unless `wait_for_ready` is set.
    #[error("no healthy endpoint available for `{0}`")]
    NoHealthyEndpoint(ServiceName),

    /// The per-call deadline elapsed before a final outcome was reached.
    #[error("call deadline exceeded")]
    DeadlineExceeded,

    /// The request message exceeded the configured size ceiling. Checked
    /// before the first attempt, so no bytes hit the wire.
    #[error("request message is {size} bytes, exceeding the {limit} byte limit")]
    RequestTooLarge { size: usize, limit: usize },

    /// The response message exceeded the configured size ceiling.
    #[error("response message is {size} bytes, exceeding the {limit} byte limit")]
    ResponseTooLarge { size: usize, limit: usize },

    /// The shared retry token bucket was empty when a retry was due.
    /// Distinct from plain attempt exhaustion: it signals system-wide
    /// degradation rather than a single slow endpoint.
    #[error("retry budget exhausted; last attempt failed with status {last}")]
    RetryBudgetExhausted { last: tonic::Status },

    /// The last attempt's status, surfaced verbatim: either its code was
    /// not retryable, or the attempt budget ran out.
    #[error(transparent)]
    Rpc(#[from] tonic::Status),
}

/// Configuration validation failures, reported at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("maxAttempts must be at least 1, got {0}")]
    InvalidMaxAttempts(u32),

    #[error("backoffMultiplier must be at least 1, got {0}")]
    InvalidBackoffMultiplier(f64),

    #[error("initialBackoff must be greater than zero")]
    ZeroInitialBackoff,

    #[error("maxBackoff ({max:?}) must not be smaller than initialBackoff ({initial:?})")]
    BackoffRange { initial: Duration, max: Duration },

    #[error("{0} is not a valid gRPC status code")]
    InvalidStatusCode(i32),

    #[error("maxTokens must be in (0, 1000], got {0}")]
    InvalidMaxTokens(u32),

    #[error("tokenRatio must be in (0, 1], got {0}")]
    InvalidTokenRatio(f64),

    #[error("methodConfig name entry has an empty service name")]
    EmptyMethodName,
}

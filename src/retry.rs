//! Retry decisions for failed requests.
//!
//! The pipeline consults a [`RetryPolicy`] whenever a request produced an
//! error answer. Only transient causes are re-injected (see
//! [`ErrorCause::retryable`]); `Ratelimited` answers are never retried
//! here — waiting out rate limits is the limiter's job, and a 429 that
//! slipped past it is surfaced to the caller. `Dropped` answers are final
//! by definition.

use std::time::Duration;

use crate::backoff::{Backoff, Jitter};
use crate::config::PipelineConfig;
use crate::error::ErrorCause;

/// Decides whether, and after how long, a failed request is re-injected.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff, jitter: Jitter) -> Self {
        Self { max_retries, backoff, jitter }
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self::new(0, Backoff::constant(Duration::ZERO), Jitter::None)
    }

    pub(crate) fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_retries, config.retry_backoff.clone(), config.retry_jitter)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The delay before re-injecting a request that has already been
    /// attempted `attempts_so_far + 1` times, or `None` when the failure is
    /// not retryable or the budget is spent.
    pub fn next_delay(&self, cause: &ErrorCause, attempts_so_far: u32) -> Option<Duration> {
        if attempts_so_far >= self.max_retries || !cause.retryable() {
            return None;
        }
        Some(self.jitter.apply(self.backoff.delay(attempts_so_far + 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> ErrorCause {
        ErrorCause::Network { message: "connection reset".into() }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            3,
            Backoff::exponential(Duration::from_millis(250)).with_max(Duration::from_secs(5)),
            Jitter::None,
        )
    }

    #[test]
    fn delays_double_from_the_base() {
        let policy = policy();
        assert_eq!(policy.next_delay(&network(), 0), Some(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(&network(), 1), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(&network(), 2), Some(Duration::from_secs(1)));
    }

    #[test]
    fn budget_exhausts_at_max_retries() {
        let policy = policy();
        assert!(policy.next_delay(&network(), 3).is_none());
        assert!(policy.next_delay(&network(), 30).is_none());
    }

    #[test]
    fn non_retryable_causes_are_final() {
        let policy = policy();
        assert!(policy.next_delay(&ErrorCause::BufferOverflow, 0).is_none());
        assert!(policy.next_delay(&ErrorCause::UnexpectedEmpty, 0).is_none());
        assert!(policy
            .next_delay(
                &ErrorCause::HttpStatus { status: http::StatusCode::NOT_FOUND, body: String::new() },
                0
            )
            .is_none());
    }

    #[test]
    fn disabled_policy_never_fires() {
        assert!(RetryPolicy::disabled().next_delay(&network(), 0).is_none());
    }

    #[test]
    fn server_errors_are_retried() {
        let cause =
            ErrorCause::HttpStatus { status: http::StatusCode::BAD_GATEWAY, body: String::new() };
        assert!(policy().next_delay(&cause, 0).is_some());
    }
}

#![deny(missing_docs)]
//! Retry wrapper for port operations.
//!
//! One implementation serves both metadata-store and storage calls: a
//! [`RetryPolicy`] fixes the base delay, the cap, and the attempt
//! ceiling; the backoff *shape* and the per-class attempt bound come
//! from the error's own classification, so an error keeps its retry
//! semantics no matter which call site drives the loop.

use optic_protocol::{RetryStrategy, WorkflowError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default base delay between attempts.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Default delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

/// Bounds for a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry; later retries scale from it.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
    /// Upper bound on attempts, further capped by each error's own
    /// classification.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// A policy with the default delays and the given attempt ceiling.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// The delay before retry `n` (n ≥ 1) under the given strategy, or
    /// `None` when the strategy does not retry.
    pub fn delay_for(&self, strategy: RetryStrategy, n: u32) -> Option<Duration> {
        let n = n.max(1);
        match strategy {
            RetryStrategy::None => None,
            RetryStrategy::Linear => Some(self.base_delay.saturating_mul(n).min(self.max_delay)),
            RetryStrategy::Exponential => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
            }
            RetryStrategy::Jittered => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                let ceiling = self.base_delay.saturating_mul(factor).min(self.max_delay);
                let micros = ceiling.as_micros().min(u64::MAX as u128) as u64;
                let jittered = if micros == 0 {
                    0
                } else {
                    rand::rng().random_range(0..=micros)
                };
                Some(Duration::from_micros(jittered))
            }
        }
    }
}

/// Drive a retryable operation to completion.
///
/// The operation is invoked with the 1-based attempt number. The loop
/// stops immediately on a non-retryable error, on cancellation, and once
/// `min(policy.max_attempts, error.max_retries)` attempts are exhausted.
/// Between attempts it sleeps per the error's retry strategy, aborting
/// the sleep on cancellation.
pub async fn with_retry<T, F, Fut>(
    operation_name: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, WorkflowError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, WorkflowError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(WorkflowError::canceled(operation_name));
        }
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(WorkflowError::canceled(operation_name));
            }
            result = operation(attempt) => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(error) => {
                let allowed = policy.max_attempts.min(error.max_retries).max(1);
                if !error.retryable() || attempt >= allowed {
                    if attempt > 1 {
                        tracing::debug!(
                            operation = operation_name,
                            attempts = attempt,
                            code = %error.code,
                            "giving up after retries"
                        );
                    }
                    return Err(error);
                }
                let delay = match policy.delay_for(error.retry_strategy, attempt) {
                    Some(delay) => delay,
                    None => return Err(error),
                };
                tracing::debug!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    code = %error.code,
                    "retrying after failure"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(WorkflowError::canceled(operation_name));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

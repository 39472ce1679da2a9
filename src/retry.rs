//! Retry classification and backoff for failed transfers
//!
//! Workers never retry on their own. The scheduler consults this module when a
//! transfer fails: under [`RetryPolicy::Manual`] nothing is retried, under
//! [`RetryPolicy::Automatic`] retryable failures are re-queued after an
//! exponential backoff with optional jitter.

use crate::config::{RetryConfig, RetryPolicy};
use crate::error::TransferError;
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, stalls, connection resets, server overload) should
/// return `true`. Permanent failures (404, disk full, unusable responses) should return
/// `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the transfer may succeed later
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TransferError {
    fn is_retryable(&self) -> bool {
        match self {
            // Server-side trouble and rate limiting clear up on their own
            TransferError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            TransferError::Network(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            TransferError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            TransferError::Stalled { .. } => true,
            TransferError::InvalidResponse(_) => false,
            TransferError::Cancelled => false,
        }
    }
}

/// Decide whether a failed item is retried automatically, and after what delay
///
/// `attempt_count` is the number of retries the item already had. Returns `None`
/// when the item must wait for a user-initiated retry.
pub fn automatic_retry_delay(
    config: &RetryConfig,
    retryable: bool,
    attempt_count: u32,
) -> Option<Duration> {
    if config.policy == RetryPolicy::Manual || !retryable || attempt_count >= config.max_attempts
    {
        return None;
    }

    let delay = backoff_delay(config, attempt_count);
    Some(if config.jitter { add_jitter(delay) } else { delay })
}

/// Exponential backoff delay before retry number `attempt_count + 1`, capped at `max_delay`
pub fn backoff_delay(config: &RetryConfig, attempt_count: u32) -> Duration {
    let factor = config.backoff_multiplier.powi(attempt_count.min(32) as i32);
    let secs = config.initial_delay.as_secs_f64() * factor;
    if !secs.is_finite() || secs >= config.max_delay.as_secs_f64() {
        return config.max_delay;
    }
    Duration::from_secs_f64(secs)
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}

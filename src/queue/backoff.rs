// src/queue/backoff.rs
//! Retry delay computation.

use crate::models::job::{BackoffKind, RetryPolicy};
use chrono::Duration;

/// Largest shift applied to the exponential base.
const MAX_EXPONENT: u32 = 20;

/// Upper bound on any single retry delay (one week).
const MAX_DELAY_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

/// Delay before the next attempt, given how many attempts have been made.
///
/// # Arguments
/// * `policy` - The job's retry policy
/// * `attempts_made` - Attempts made so far, including the one that just failed
///
/// # Returns
/// `base * 2^(attempts_made - 1)` for exponential, `base * attempts_made` for
/// linear, zero for none.
///
/// The exponent counts earlier failures rather than attempts made, so this is
/// `base * 2^attempts_made` shifted by one: the first retry waits exactly `base`
/// and the ratio between consecutive delays stays 2.
pub fn retry_delay(policy: &RetryPolicy, attempts_made: u32) -> Duration {
    let attempts = u64::from(attempts_made.max(1));
    let millis = match policy.backoff {
        BackoffKind::None => 0,
        BackoffKind::Linear => policy.base_delay_ms.saturating_mul(attempts),
        BackoffKind::Exponential => {
            let exponent = (attempts_made.max(1) - 1).min(MAX_EXPONENT);
            policy.base_delay_ms.saturating_mul(1u64 << exponent)
        }
    };
    Duration::milliseconds(i64::try_from(millis.min(MAX_DELAY_MS)).unwrap_or(0))
}

/// Whether a job that just failed with a retryable error gets another attempt.
pub fn should_retry(policy: &RetryPolicy, attempts_made: u32) -> bool {
    attempts_made < policy.attempts
}

//! Shared exponential-backoff retry policy.
//!
//! Used by the step executor for transient provider failures and by the
//! fal adapters for completion polling. Attempt counts are bounded so a
//! stuck provider eventually fails the job instead of spinning forever.

use std::time::Duration;

/// Default bound on `submit` attempts (first try + retries).
pub const DEFAULT_MAX_SUBMIT_ATTEMPTS: u32 = 3;

/// Default bound on `await_result` attempts.
pub const DEFAULT_MAX_AWAIT_ATTEMPTS: u32 = 5;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: DEFAULT_MAX_AWAIT_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Policy for provider submission retries (transient-only, tight bound).
    pub fn submit() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_SUBMIT_ATTEMPTS,
            ..Default::default()
        }
    }

    /// Policy for awaiting provider completion.
    pub fn await_completion() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_AWAIT_ATTEMPTS,
            ..Default::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait before attempt `attempt` (1-based; attempt 1 is the
    /// first retry). Grows geometrically, clamped to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = next_delay(delay, self);
        }
        delay
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

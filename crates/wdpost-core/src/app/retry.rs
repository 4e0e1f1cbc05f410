//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Backoff for retryable task failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the failures so far (1-indexed).
    ///
    /// `delay = base_delay * multiplier^(retries - 1)`; with base 2s and
    /// multiplier 2.0: 2s, 4s, 8s, 16s, ...
    pub fn next_delay(&self, retries: u32) -> Duration {
        let exponent = i32::try_from(retries.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // an overflowing power saturates instead of panicking in from_secs_f64
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

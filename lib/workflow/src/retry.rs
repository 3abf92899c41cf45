//! Exponential backoff for transient failures.

use crate::config::RetryConfig;
use std::time::Duration;

/// Decides whether and when a failed attempt is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1.0),
        }
    }

    /// Policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay before the attempt after `failed_attempt`, or
    /// `None` once attempts are exhausted.
    #[must_use]
    pub fn delay_after(&self, failed_attempt: u32) -> Option<Duration> {
        if failed_attempt >= self.max_attempts {
            return None;
        }
        if self.initial_backoff.is_zero() {
            return Some(Duration::ZERO);
        }
        let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.multiplier.powi(exponent) * self.initial_backoff.as_secs_f64();
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return Some(self.max_backoff);
        }
        let delay = Duration::try_from_secs_f64(secs)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff));
        Some(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

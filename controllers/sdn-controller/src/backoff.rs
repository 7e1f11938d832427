//! # Exponential Backoff
//!
//! Retry delay policy attached to every work queue. A failed key waits
//! `base * factor^n` (n = consecutive failures so far), capped at `max`.
//! A successful reconciliation resets the key back to `base`.
//!
//! Defaults: 5ms base, factor 2, 1000s cap.

use std::time::Duration;

/// Default first retry delay
pub const DEFAULT_BASE: Duration = Duration::from_millis(5);
/// Default delay cap
pub const DEFAULT_MAX: Duration = Duration::from_secs(1000);
/// Default growth factor
pub const DEFAULT_FACTOR: u32 = 2;

/// Exponential backoff policy
///
/// Stateless: the work queue keeps the failure count of each key and asks
/// for the matching delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    factor: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX)
    }
}

impl ExponentialBackoff {
    /// Create a backoff doubling from `base` up to `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            factor: DEFAULT_FACTOR,
        }
    }

    /// Delay after `failures` previous consecutive failures.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        Self::calculate_for_error_count(failures, self.base, self.max, self.factor)
    }

    /// `base * factor^error_count`, capped at `max`.
    #[must_use]
    pub fn calculate_for_error_count(
        error_count: u32,
        base: Duration,
        max: Duration,
        factor: u32,
    ) -> Duration {
        let multiplier = factor.max(1).checked_pow(error_count);
        match multiplier.and_then(|m| base.checked_mul(m)) {
            Some(delay) => delay.min(max),
            None => max,
        }
    }
}

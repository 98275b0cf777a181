use std::time::Duration;

use crate::config::MAX_RETRY_DELAY_SECS;

/// Represents the state of backoff attempts.
#[derive(Clone, Copy)]
pub(crate) struct BackOff {
    consecutive_failures: u32,
}

impl BackOff {
    /// Creates a new `BackOff` with no failures.
    pub(crate) fn new() -> Self {
        Self {
            consecutive_failures: 0,
        }
    }

    /// Increments the count of consecutive failures and returns the new count.
    pub(crate) fn inc_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    /// Calculates the delay before the next attempt based on the number of consecutive failures.
    pub(crate) fn calculate_delay(&self) -> Duration {
        let base_delay = Duration::from_secs(1);
        let max_delay = Duration::from_secs(MAX_RETRY_DELAY_SECS);
        std::cmp::min(
            base_delay * 2u32.saturating_pow(self.consecutive_failures.min(16)),
            max_delay,
        )
    }

    /// Resets the backoff state to its initial values.
    pub(crate) fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Bounded exponential backoff for transient task failures.
///
/// `max_attempts` counts every execution including the first, so a policy
/// of 3 means one initial try plus at most two retries. Permanent failures
/// never retry regardless of remaining attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Whether the attempt that just failed (1-based) should be retried.
    pub fn should_retry(&self, attempt: u32, error: &TaskError) -> bool {
        attempt < self.max_attempts && error.is_transient()
    }

    /// Delay before the retry following `attempt` (1-based): base doubled
    /// per prior attempt, capped at the maximum. A rate-limit hint from the
    /// provider overrides the computed delay.
    pub fn delay_after(&self, attempt: u32, error: &TaskError) -> Duration {
        if let TaskError::RateLimited {
            retry_after_secs: Some(secs),
        } = error
        {
            return Duration::from_secs(*secs);
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with additive jitter for the inner per-stage retry loop.
///
/// Formula: `delay = min(base_delay * 2^attempt, max_backoff) + uniform(0, jitter_max)`
///
/// The cross-delivery retry interval is not governed by this policy; it belongs
/// to the queue's own redelivery mechanism.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay in milliseconds, doubled for every attempt.
    pub base_delay_ms: u64,
    /// Upper bound of the uniformly distributed jitter in milliseconds.
    pub jitter_max_ms: u64,
    /// Cap applied to the exponential component in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            jitter_max_ms: 10_000,
            max_backoff_ms: 600_000, // 10 minutes
        }
    }
}

impl BackoffPolicy {
    /// A policy that never waits. Useful for tests and synchronous tooling.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            jitter_max_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Deterministic component of the delay for a 1-based attempt number.
    ///
    /// Strictly increasing in `attempt` until the cap is reached.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let scaled = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(scaled.min(self.max_backoff_ms))
    }

    /// Random jitter drawn uniformly from `[0, jitter_max]`.
    pub fn jitter(&self) -> Duration {
        if self.jitter_max_ms == 0 {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(0..=self.jitter_max_ms);
        Duration::from_millis(ms)
    }

    /// Full delay to wait after the given failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + self.jitter()
    }
}

/// Determines if an item should be dead-lettered based on its retry count.
///
/// Returns true when `total_retry_count >= max_total_retries`. The count is
/// expected to already include the failure being settled.
pub fn should_dead_letter(total_retry_count: u32, max_total_retries: u32) -> bool {
    total_retry_count >= max_total_retries
}

use std::time::Duration;

use crate::config::WorkerConfig;

/// Bounded attempts with capped exponential backoff between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl From<&WorkerConfig> for RetryPolicy {
    fn from(worker: &WorkerConfig) -> Self {
        Self {
            max_attempts: worker.max_attempts,
            base_delay: Duration::from_millis(worker.backoff_base_ms),
            max_delay: Duration::from_millis(worker.backoff_max_ms),
        }
    }
}

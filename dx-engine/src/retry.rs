//! Command retry backoff

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay before a failed command runs again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time; a command's own `period` takes precedence
    Fixed { delay_ms: u64 },
    /// Delay grows by `multiplier` per attempt, capped at `max_delay_ms`
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay after the `attempt`-th failed execution (1-based)
    pub fn delay_for_attempt(&self, attempt: u32, period_ms: Option<u64>) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(period_ms.unwrap_or(*delay_ms)),
            BackoffStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                let delay = (*initial_delay_ms as f64) * multiplier.powi(exponent);
                let delay = delay.min(*max_delay_ms as f64).max(0.0);
                Duration::from_millis(delay as u64)
            }
        }
    }

    /// Longest delay this strategy can produce
    pub fn max_delay(&self, period_ms: Option<u64>) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(period_ms.unwrap_or(*delay_ms)),
            BackoffStrategy::Exponential { max_delay_ms, .. } => Duration::from_millis(*max_delay_ms),
        }
    }
}

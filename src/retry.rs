// 🔁 Exponential backoff between retries of a failed entity operation
//
// delay(retry n) = base * factor^(n-1), clamped to max_delay, no jitter
// (backoff may add up to 1ns)

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::time::Duration;

use crate::config::OrchestratorConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Factor by which the delay grows after each failure
    pub factor: f64,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Expects a validated config (durations representable)
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::try_from_secs_f64(config.backoff_base_seconds)
                .unwrap_or(defaults.base_delay),
            factor: config.backoff_factor,
            max_delay: Duration::try_from_secs_f64(config.max_backoff_seconds)
                .unwrap_or(defaults.max_delay),
        }
    }

    /// Total attempts an entity gets in one cycle
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delays before each retry, in order; yields `max_retries` items
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send {
        let first = self.base_delay.min(self.max_delay);
        let mut backoff = ExponentialBackoff {
            current_interval: first,
            initial_interval: first,
            randomization_factor: 0.0,
            multiplier: self.factor,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        std::iter::from_fn(move || backoff.next_backoff()).take(self.max_retries as usize)
    }
}

use std::time::Duration;

use crate::common::config::BackoffConfig;

/// Bounded exponential back-off: `base * factor^n`, capped at `max`, for at
/// most `max_attempts` tries.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: u32,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Backoff {
            base: Duration::from_millis(config.base_ms),
            max: Duration::from_millis(config.max_ms),
            factor: config.factor.max(1),
            max_attempts: config.max_attempts.max(1),
            attempt: 0,
        }
    }

    /// Registers an attempt. Returns how long to wait before the next one,
    /// or `None` once the attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            return None;
        }
        let multiplier = self.factor.saturating_pow(self.attempt - 1);
        Some(self.base.saturating_mul(multiplier).min(self.max))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

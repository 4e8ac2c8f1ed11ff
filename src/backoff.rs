//! Capped exponential retry delays.

use std::time::Duration;

use crate::constants::{DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX};

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_BACKOFF_INITIAL,
            max_delay: DEFAULT_BACKOFF_MAX,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay for a given attempt number (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        if !delay_secs.is_finite() || delay_secs < 0.0 || delay_secs >= max_secs {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// Same growth, starting from `initial_delay`. The cap is raised to
    /// `initial_delay` if it sits below it.
    #[must_use]
    pub fn seeded(self, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: self.max_delay.max(initial_delay),
            multiplier: self.multiplier,
        }
    }
}

/// Attempt counter over a [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a fresh backoff sequence.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Records a failed attempt and returns how long to wait before the next.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.config.delay_for_attempt(self.attempt)
    }

    /// Restarts the sequence after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed attempts since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}

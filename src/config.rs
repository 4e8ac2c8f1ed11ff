//! Poll loop configuration.

use std::time::Duration;

use thiserror::Error;

use crate::backoff::BackoffConfig;
use crate::constants::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_DEGRADED_THRESHOLD, DEFAULT_POLL_INTERVAL, MAX_POLL_INTERVAL,
    MIN_POLL_INTERVAL,
};

/// Rejected configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Poll interval outside the accepted range.
    #[error("poll interval {actual:?} outside [{min:?}, {max:?}]")]
    PollIntervalOutOfRange {
        /// Configured interval.
        actual: Duration,
        /// Lower bound.
        min: Duration,
        /// Upper bound.
        max: Duration,
    },

    /// Store calls must carry a non-zero timeout.
    #[error("call timeout must be non-zero")]
    ZeroCallTimeout,

    /// At least one failure must be tolerated before degrading.
    #[error("degraded threshold must be at least 1")]
    ZeroDegradedThreshold,

    /// Backoff parameters that cannot produce a growing delay.
    #[error("invalid backoff: {0}")]
    InvalidBackoff(&'static str),
}

/// Configuration shared by every subscriber's poll task.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Time between ticks in the steady state.
    pub poll_interval: Duration,
    /// Bound on every record store call.
    pub call_timeout: Duration,
    /// Consecutive sampler failures before entering the degraded state.
    pub degraded_threshold: u32,
    /// Retry delays for resolution and degraded sampling.
    pub backoff: BackoffConfig,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            degraded_threshold: DEFAULT_DEGRADED_THRESHOLD,
            backoff: BackoffConfig::default(),
        }
    }
}

impl PollConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the store call timeout.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the degraded threshold.
    #[must_use]
    pub const fn with_degraded_threshold(mut self, threshold: u32) -> Self {
        self.degraded_threshold = threshold;
        self
    }

    /// Sets the backoff parameters.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Checks every field against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval < MIN_POLL_INTERVAL || self.poll_interval > MAX_POLL_INTERVAL {
            return Err(ConfigError::PollIntervalOutOfRange {
                actual: self.poll_interval,
                min: MIN_POLL_INTERVAL,
                max: MAX_POLL_INTERVAL,
            });
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::ZeroCallTimeout);
        }
        if self.degraded_threshold == 0 {
            return Err(ConfigError::ZeroDegradedThreshold);
        }
        if self.backoff.initial_delay.is_zero() {
            return Err(ConfigError::InvalidBackoff("initial delay is zero"));
        }
        if self.backoff.max_delay < self.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff("max delay below initial delay"));
        }
        if !(self.backoff.multiplier >= 1.0) {
            return Err(ConfigError::InvalidBackoff("multiplier below 1"));
        }
        Ok(())
    }
}

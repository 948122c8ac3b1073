//! BFT configuration.

use std::time::Duration;

/// Errors validating a [`BftConfig`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("base timeout must be greater than zero")]
    ZeroBaseTimeout,
    #[error("timeout rate must be greater than 1.0, got {0}")]
    InvalidTimeoutRate(f64),
    #[error("maximum timeout {base:?} * {rate}^{exponent} does not fit in a Duration")]
    TimeoutOverflow {
        base: Duration,
        rate: f64,
        exponent: u32,
    },
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
}

/// Configuration for BFT consensus.
#[derive(Debug, Clone)]
pub struct BftConfig {
    /// Pacemaker timeout for a view with no preceding timeouts.
    pub base_timeout: Duration,

    /// Backoff multiplier applied per consecutive timeout.
    pub timeout_rate: f64,

    /// Cap on the backoff exponent.
    pub max_timeout_exponent: u32,

    /// How long to wait for a sync response before asking another peer.
    pub sync_request_timeout: Duration,

    /// Maximum vertices requested or served in one sync round trip.
    pub max_sync_batch: usize,

    /// Maximum events parked while waiting for missing ancestors.
    pub max_deferred_events: usize,

    /// Maximum proposals buffered for views ahead of the current one.
    pub max_future_proposals: usize,

    /// Views a committed vertex stays in the store to serve sync requests.
    pub committed_retention_views: u64,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_millis(1000),
            timeout_rate: 1.2,
            max_timeout_exponent: 6,
            sync_request_timeout: Duration::from_millis(500),
            max_sync_batch: 50,
            max_deferred_events: 1024,
            max_future_proposals: 64,
            committed_retention_views: 100,
        }
    }
}

impl BftConfig {
    /// Create a new BFT config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base pacemaker timeout.
    pub fn with_base_timeout(mut self, timeout: Duration) -> Self {
        self.base_timeout = timeout;
        self
    }

    /// Set the backoff rate and exponent cap.
    pub fn with_backoff(mut self, rate: f64, max_exponent: u32) -> Self {
        self.timeout_rate = rate;
        self.max_timeout_exponent = max_exponent;
        self
    }

    /// Set the sync request timeout.
    pub fn with_sync_request_timeout(mut self, timeout: Duration) -> Self {
        self.sync_request_timeout = timeout;
        self
    }

    /// Check every parameter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_timeout.is_zero() {
            return Err(ConfigError::ZeroBaseTimeout);
        }
        if self.timeout_rate.is_nan() || self.timeout_rate <= 1.0 || self.timeout_rate.is_infinite() {
            return Err(ConfigError::InvalidTimeoutRate(self.timeout_rate));
        }
        if self.max_timeout().is_none() {
            return Err(ConfigError::TimeoutOverflow {
                base: self.base_timeout,
                rate: self.timeout_rate,
                exponent: self.max_timeout_exponent,
            });
        }
        if self.sync_request_timeout.is_zero() {
            return Err(ConfigError::ZeroLimit("sync_request_timeout"));
        }
        if self.max_sync_batch == 0 {
            return Err(ConfigError::ZeroLimit("max_sync_batch"));
        }
        if self.max_deferred_events == 0 {
            return Err(ConfigError::ZeroLimit("max_deferred_events"));
        }
        Ok(())
    }

    /// Timeout after `consecutive_timeouts` timeouts in a row, or `None` if
    /// it overflows.
    pub fn timeout_for(&self, consecutive_timeouts: u32) -> Option<Duration> {
        let exponent = consecutive_timeouts.min(self.max_timeout_exponent);
        let factor = self.timeout_rate.powi(exponent as i32);
        Duration::try_from_secs_f64(self.base_timeout.as_secs_f64() * factor).ok()
    }

    /// Largest timeout the backoff can reach.
    pub fn max_timeout(&self) -> Option<Duration> {
        self.timeout_for(self.max_timeout_exponent)
    }
}

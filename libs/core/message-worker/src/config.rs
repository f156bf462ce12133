//! Worker configuration
//!
//! This module provides `WorkerConfig` for configuring the consumption loop.

use crate::resilience::RetryPolicyConfig;
use core_config::worker::WorkerSettings;
use std::time::Duration;

/// Configuration for the consumption loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// How long in-flight dispatches may run after cancellation
    pub shutdown_grace: Duration,

    /// Cap on the backoff after consecutive receive errors
    pub max_receive_backoff: Duration,

    /// Retry policy for acknowledge/abandon calls
    pub settle_retry: RetryPolicyConfig,

    /// Faulted messages delivered this many times are dead-lettered
    /// instead of abandoned. `None` redelivers forever.
    pub max_deliveries: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(30),
            max_receive_backoff: Duration::from_secs(30),
            settle_retry: RetryPolicyConfig::default(),
            max_deliveries: Some(5),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from env-loaded worker settings
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        let config =
            Self::default().with_shutdown_grace(Duration::from_secs(settings.shutdown_grace_secs));
        match settings.max_deliveries {
            0 => config.without_dead_lettering(),
            max => config.with_max_deliveries(max),
        }
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the receive error backoff cap
    pub fn with_max_receive_backoff(mut self, max: Duration) -> Self {
        self.max_receive_backoff = max;
        self
    }

    /// Set the retry policy for settling messages
    pub fn with_settle_retry(mut self, retry: RetryPolicyConfig) -> Self {
        self.settle_retry = retry;
        self
    }

    /// Dead-letter faulted messages once delivered `max` times
    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = Some(max.max(1));
        self
    }

    /// Keep abandoning faulted messages regardless of delivery count
    pub fn without_dead_lettering(mut self) -> Self {
        self.max_deliveries = None;
        self
    }

    /// Whether a faulted message with this delivery count is dead-lettered
    pub fn should_dead_letter(&self, delivery_count: u32) -> bool {
        self.max_deliveries.is_some_and(|max| delivery_count >= max)
    }

    /// Backoff after `consecutive_errors` failed receives: 1, 2, 4 ... seconds, capped.
    pub fn receive_backoff(&self, consecutive_errors: u32) -> Duration {
        let exponent = consecutive_errors.saturating_sub(1).min(16);
        Duration::from_secs(1u64 << exponent).min(self.max_receive_backoff)
    }
}

use crate::{env_parse, ConfigError, FromEnv};

/// Runtime settings shared by message worker services
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Port for the health and metrics server
    pub health_port: u16,
    /// How long in-flight dispatches may run after a shutdown signal
    pub shutdown_grace_secs: u64,
    /// How long a broker receive call blocks waiting for messages
    pub receive_block_ms: u64,
    /// Idle time after which unacknowledged messages are reclaimed for redelivery
    pub claim_idle_ms: u64,
    /// Deliveries after which a faulted message is dead-lettered (0 disables)
    pub max_deliveries: u32,
    /// Minimum wait before an abandoned message is redelivered
    pub redelivery_delay_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            health_port: 8082,
            shutdown_grace_secs: 30,
            receive_block_ms: 1000,
            claim_idle_ms: 30_000,
            max_deliveries: 5,
            redelivery_delay_ms: 5_000,
        }
    }
}

impl FromEnv for WorkerSettings {
    /// Reads from environment variables with defaults:
    /// - HEALTH_PORT: 8082
    /// - SHUTDOWN_GRACE_SECS: 30
    /// - RECEIVE_BLOCK_MS: 1000
    /// - CLAIM_IDLE_MS: 30000
    /// - MAX_DELIVERIES: 5 (0 disables dead-lettering)
    /// - REDELIVERY_DELAY_MS: 5000 (at most CLAIM_IDLE_MS)
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let settings = Self {
            health_port: env_parse("HEALTH_PORT", defaults.health_port)?,
            shutdown_grace_secs: env_parse("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs)?,
            receive_block_ms: env_parse("RECEIVE_BLOCK_MS", defaults.receive_block_ms)?,
            claim_idle_ms: env_parse("CLAIM_IDLE_MS", defaults.claim_idle_ms)?,
            max_deliveries: env_parse("MAX_DELIVERIES", defaults.max_deliveries)?,
            redelivery_delay_ms: env_parse("REDELIVERY_DELAY_MS", defaults.redelivery_delay_ms)?,
        };

        if settings.receive_block_ms == 0 {
            return Err(ConfigError::Invalid(
                "RECEIVE_BLOCK_MS must be greater than zero".to_string(),
            ));
        }

        if settings.redelivery_delay_ms > settings.claim_idle_ms {
            return Err(ConfigError::Invalid(
                "REDELIVERY_DELAY_MS must not exceed CLAIM_IDLE_MS".to_string(),
            ));
        }

        Ok(settings)
    }
}

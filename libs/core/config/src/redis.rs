use crate::{env_parse, env_required, ConfigError, FromEnv};

/// Redis configuration
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub uri: String,
    /// Maximum entries kept per stream (`XADD MAXLEN ~`).
    pub max_stream_length: i64,
    /// Per-command response timeout on the command connection.
    /// Blocking reads extend it by their block time.
    pub response_timeout_ms: u64,
}

impl RedisConfig {
    pub fn new(uri: String) -> Self {
        Self {
            uri,
            max_stream_length: 100_000,
            response_timeout_ms: 500,
        }
    }
}

impl FromEnv for RedisConfig {
    /// Requires REDIS_HOST to be set (no default).
    /// REDIS_STREAM_MAX_LENGTH defaults to 100000.
    /// REDIS_RESPONSE_TIMEOUT_MS defaults to 500 and must be positive.
    fn from_env() -> Result<Self, ConfigError> {
        let response_timeout_ms = env_parse("REDIS_RESPONSE_TIMEOUT_MS", 500)?;
        if response_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "REDIS_RESPONSE_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            uri: env_required("REDIS_HOST")?,
            max_stream_length: env_parse("REDIS_STREAM_MAX_LENGTH", 100_000)?,
            response_timeout_ms,
        })
    }
}

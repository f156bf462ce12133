//! Retry policy for outbound calls.
//!
//! Wraps an operation that can fail transiently (broker calls, HTTP requests)
//! and retries it with fixed or exponential backoff.
//!
//! ## Backoff
//!
//! ```text
//! exponential:  attempt 1 ─ 2s ─ attempt 2 ─ 4s ─ attempt 3 ─ 8s ─ attempt 4
//! fixed (5s):   attempt 1 ─ 5s ─ attempt 2 ─ 5s ─ attempt 3 ─ 5s ─ attempt 4
//! ```
//!
//! Only errors whose [`Transience`] is transient are retried; anything else is
//! returned after the first attempt.
//!
//! ## Example
//!
//! ```rust,ignore
//! use message_worker::{RetryPolicy, RetryPolicyConfig};
//!
//! let policy = RetryPolicy::new(RetryPolicyConfig::exponential(3))?;
//! let body = policy.execute(|| async { client.fetch().await }).await?;
//! ```

use crate::error::Transience;
use core_config::{ConfigError, FromEnv, env_flag, env_parse};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on `retry_count`; beyond it exponential waits stop being meaningful.
pub const MAX_RETRY_COUNT: u32 = 32;

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyConfig {
    /// Wait 2^k seconds before retry k instead of a fixed wait
    pub exponential_backoff: bool,

    /// Retries after the first attempt
    pub retry_count: u32,

    /// Seconds between retries in fixed mode
    pub fixed_wait_seconds: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            exponential_backoff: true,
            retry_count: 3,
            fixed_wait_seconds: 5,
        }
    }
}

impl RetryPolicyConfig {
    /// Exponential backoff with `retry_count` retries.
    pub fn exponential(retry_count: u32) -> Self {
        Self {
            exponential_backoff: true,
            retry_count,
            ..Self::default()
        }
    }

    /// Fixed backoff of `wait_seconds` with `retry_count` retries.
    pub fn fixed(retry_count: u32, wait_seconds: u64) -> Self {
        Self {
            exponential_backoff: false,
            retry_count,
            fixed_wait_seconds: wait_seconds,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::fixed(0, 0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_count > MAX_RETRY_COUNT {
            return Err(ConfigError::Invalid(format!(
                "retry count {} exceeds maximum of {}",
                self.retry_count, MAX_RETRY_COUNT
            )));
        }
        Ok(())
    }

    /// Wait before retry `retry` (1-indexed).
    pub fn wait_before_retry(&self, retry: u32) -> Duration {
        if self.exponential_backoff {
            Duration::from_secs(1u64 << retry.min(63))
        } else {
            Duration::from_secs(self.fixed_wait_seconds)
        }
    }
}

impl FromEnv for RetryPolicyConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            exponential_backoff: env_flag("RETRY_EXPONENTIAL_BACKOFF", defaults.exponential_backoff)?,
            retry_count: non_negative("RETRY_COUNT", defaults.retry_count.into())?
                .try_into()
                .map_err(|_| ConfigError::Invalid("RETRY_COUNT is out of range".to_string()))?,
            fixed_wait_seconds: non_negative(
                "RETRY_FIXED_WAIT_SECONDS",
                defaults.fixed_wait_seconds as i64,
            )?,
        };
        config.validate()?;
        Ok(config)
    }
}

fn non_negative(key: &str, default: i64) -> Result<u64, ConfigError> {
    let value: i64 = env_parse(key, default)?;
    u64::try_from(value).map_err(|_| ConfigError::Invalid(format!("{} must not be negative", key)))
}

/// One scheduled retry, passed to the observer of [`RetryPolicy::execute_observed`].
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// Retry number (1-indexed)
    pub attempt: u32,
    /// Wait before the retry runs
    pub wait: Duration,
    /// Failure of the previous attempt
    pub error: &'a E,
}

/// Validated, shareable retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: Arc<RetryPolicyConfig>,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Policy that runs every operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            config: Arc::new(RetryPolicyConfig::none()),
        }
    }

    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }

    /// Run `operation`, retrying transient failures.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transience + Display,
    {
        self.execute_observed(operation, |_| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_retry` before every wait.
    pub async fn execute_observed<F, Fut, T, E, O>(
        &self,
        mut operation: F,
        mut on_retry: O,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transience + Display,
        O: FnMut(&RetryAttempt<'_, E>),
    {
        let mut retry = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(retries = retry, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => {
                    debug!(error = %err, "Permanent failure, not retrying");
                    return Err(err);
                }
                Err(err) => {
                    retry += 1;
                    if retry > self.config.retry_count {
                        warn!(
                            attempts = retry,
                            error = %err,
                            "Operation failed after exhausting retries"
                        );
                        return Err(err);
                    }

                    let wait = self.config.wait_before_retry(retry);
                    on_retry(&RetryAttempt {
                        attempt: retry,
                        wait,
                        error: &err,
                    });
                    debug!(
                        attempt = retry,
                        max_retries = self.config.retry_count,
                        wait_secs = wait.as_secs(),
                        error = %err,
                        "Transient failure, retrying"
                    );

                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

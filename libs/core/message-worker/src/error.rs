//! Error types and error categorization
//!
//! Errors are categorized to determine retry behavior of outbound calls:
//! - **Transient**: Temporary failures (broker unavailable, timeouts, 5xx), retried
//! - **Permanent**: Everything else, surfaced immediately

use crate::registry::BindingKey;
use thiserror::Error;

/// Boxed error carried across handler boundaries without losing its concrete type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - retried by the retry policy
    Transient,
    /// Unrecoverable error - never retried
    Permanent,
}

/// Classifies an error as transient or permanent.
///
/// Every error passed through [`RetryPolicy::execute`](crate::RetryPolicy::execute)
/// implements this trait.
pub trait Transience {
    fn category(&self) -> ErrorCategory;

    fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Handler discovery errors. Always fatal at startup.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Two handlers of one worker type claim the same source
    #[error("Duplicate binding {key} in worker {worker}")]
    DuplicateBinding { worker: &'static str, key: BindingKey },

    /// A binding is missing required metadata or carries inconsistent metadata
    #[error("Invalid binding {key} in worker {worker}: {reason}")]
    InvalidBinding {
        worker: &'static str,
        key: BindingKey,
        reason: String,
    },

    /// The same worker type was registered twice with one registry
    #[error("Worker {0} is already registered")]
    WorkerAlreadyRegistered(&'static str),
}

/// Payload encoding/decoding errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Payload is not valid JSON for {target}: {source}")]
    InvalidJson {
        target: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Why a dispatch faulted
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The payload could not be decoded into the handler's argument type
    #[error("Payload decode failed: {0}")]
    PayloadDecode(#[from] CodecError),

    /// The handler returned an error; the original error value is preserved
    #[error("Handler failed: {0}")]
    Handler(#[source] BoxError),

    /// The handler panicked
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl DispatchError {
    /// The error returned by the handler, if the handler itself failed.
    pub fn handler_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            DispatchError::Handler(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// Downcast the handler's error back to its original type.
    pub fn downcast_handler<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.handler_error().and_then(|err| err.downcast_ref::<E>())
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::PayloadDecode(_) => "payload",
            DispatchError::Handler(_) => "handler",
            DispatchError::Panicked(_) => "panic",
        }
    }
}

/// Broker connector errors
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Broker cannot be reached right now
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Broker operation timed out
    #[error("Broker operation timed out: {0}")]
    Timeout(String),

    /// Broker refused the operation
    #[error("Broker rejected operation: {0}")]
    Rejected(String),

    /// Operation or option not supported by this connector
    #[error("Unsupported by {connector}: {what}")]
    Unsupported {
        connector: &'static str,
        what: String,
    },

    /// The handle does not refer to a subscription opened on this connector
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    /// Payload could not be encoded before sending
    #[error(transparent)]
    Encode(#[from] CodecError),

    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl Transience for BrokerError {
    fn category(&self) -> ErrorCategory {
        match self {
            BrokerError::Unavailable(_) | BrokerError::Timeout(_) => ErrorCategory::Transient,
            BrokerError::Redis(err)
                if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() =>
            {
                ErrorCategory::Transient
            }
            _ => ErrorCategory::Permanent,
        }
    }
}

/// Consumption loop errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] core_config::ConfigError),

    /// None of the worker's bindings could be subscribed
    #[error("No subscription could be opened for worker {0}")]
    NoSubscriptions(&'static str),

    /// `run` was called while the loop is not stopped
    #[error("Worker {0} is already running")]
    AlreadyRunning(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("inventory exhausted for {0}")]
    struct InventoryError(String);

    #[test]
    fn test_broker_error_categories() {
        assert!(BrokerError::Unavailable("down".into()).is_transient());
        assert!(BrokerError::Timeout("slow".into()).is_transient());
        assert!(!BrokerError::Rejected("bad".into()).is_transient());
        assert_eq!(
            BrokerError::Unsupported {
                connector: "test",
                what: "filters".into()
            }
            .category(),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn test_dispatch_error_preserves_handler_error() {
        let err = DispatchError::Handler(Box::new(InventoryError("sku-1".into())));

        let original = err.downcast_handler::<InventoryError>().unwrap();
        assert_eq!(original.0, "sku-1");
        assert_eq!(err.kind(), "handler");
        assert!(err.to_string().contains("inventory exhausted"));
    }

    #[test]
    fn test_dispatch_error_payload_has_no_handler_error() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err = DispatchError::from(CodecError::InvalidJson {
            target: "u32",
            source: json_err,
        });

        assert!(err.handler_error().is_none());
        assert_eq!(err.kind(), "payload");
    }
}

//! Telemetry sink used by the consumption loop.

use crate::error::{BrokerError, DispatchError, RegistryError};
use std::error::Error;
use tracing::{error, info};

/// Receives exceptions and lifecycle events. Calls must return quickly and never fail.
pub trait Telemetry: Send + Sync {
    fn report_exception(&self, error: &(dyn Error + 'static));

    fn report_event(&self, name: &str);
}

/// Telemetry that only writes `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn report_exception(&self, err: &(dyn Error + 'static)) {
        error!(kind = exception_kind(err), error = %err, "Exception reported");
    }

    fn report_event(&self, name: &str) {
        info!(event = name, "Event reported");
    }
}

/// Coarse label for an error, used as a metrics label.
pub fn exception_kind(err: &(dyn Error + 'static)) -> &'static str {
    if let Some(dispatch) = err.downcast_ref::<DispatchError>() {
        dispatch.kind()
    } else if err.is::<BrokerError>() {
        "broker"
    } else if err.is::<RegistryError>() {
        "registry"
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_kind() {
        let broker = BrokerError::Timeout("receive".into());
        assert_eq!(exception_kind(&broker), "broker");

        let panicked = DispatchError::Panicked("boom".into());
        assert_eq!(exception_kind(&panicked), "panic");

        let io = std::io::Error::other("disk");
        assert_eq!(exception_kind(&io), "other");
    }
}

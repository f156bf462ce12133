//! Prometheus metrics for message workers
//!
//! Provides observability into dispatch outcomes and loop health.

use crate::registry::BindingKey;
use crate::telemetry::{Telemetry, exception_kind};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::error::Error;
use std::time::Duration;
use tracing::{error, info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    match PROMETHEUS_HANDLE.get_or_try_init(|| PrometheusBuilder::new().install_recorder()) {
        Ok(_) => info!("Prometheus metrics initialized"),
        Err(e) => warn!(error = %e, "Failed to install Prometheus recorder, metrics disabled"),
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Metrics and telemetry for one worker type
#[derive(Clone, Debug)]
pub struct WorkerMetrics {
    worker: String,
}

impl WorkerMetrics {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
        }
    }

    /// Record a batch received on a binding
    pub fn messages_received(&self, binding: &BindingKey, count: usize) {
        counter!(
            "message_worker_messages_received_total",
            "worker" => self.worker.clone(),
            "binding" => binding.to_string()
        )
        .increment(count as u64);
    }

    /// Record the outcome and duration of one dispatch
    pub fn record_dispatch(&self, binding: &BindingKey, outcome: &'static str, duration: Duration) {
        counter!(
            "message_worker_dispatches_total",
            "worker" => self.worker.clone(),
            "binding" => binding.to_string(),
            "outcome" => outcome
        )
        .increment(1);

        histogram!(
            "message_worker_dispatch_duration_seconds",
            "worker" => self.worker.clone(),
            "binding" => binding.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a message moved to its dead-letter destination
    pub fn message_dead_lettered(&self, binding: &BindingKey) {
        counter!(
            "message_worker_dead_lettered_total",
            "worker" => self.worker.clone(),
            "binding" => binding.to_string()
        )
        .increment(1);
    }

    /// Update the open subscriptions gauge
    pub fn open_subscriptions(&self, count: usize) {
        gauge!(
            "message_worker_open_subscriptions",
            "worker" => self.worker.clone()
        )
        .set(count as f64);
    }
}

impl Telemetry for WorkerMetrics {
    fn report_exception(&self, err: &(dyn Error + 'static)) {
        let kind = exception_kind(err);
        counter!(
            "message_worker_exceptions_total",
            "worker" => self.worker.clone(),
            "kind" => kind
        )
        .increment(1);
        error!(worker = %self.worker, kind, error = %err, "Exception reported");
    }

    fn report_event(&self, name: &str) {
        counter!(
            "message_worker_events_total",
            "worker" => self.worker.clone(),
            "event" => name.to_string()
        )
        .increment(1);
        info!(worker = %self.worker, event = name, "Event reported");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::registry::SourceType;

    #[test]
    fn test_recorded_metrics_are_rendered() {
        init_metrics();
        init_metrics();

        let metrics = WorkerMetrics::new("orders");
        let binding = BindingKey {
            source: SourceType::Queue,
            name: "orders:placed".into(),
            subscription: None,
        };
        metrics.report_event("loop_started");
        metrics.report_exception(&BrokerError::Timeout("receive".into()));
        metrics.record_dispatch(&binding, "completed", Duration::from_millis(5));
        metrics.message_dead_lettered(&binding);

        let rendered = render_metrics();
        assert!(rendered.contains("message_worker_events_total"));
        assert!(rendered.contains("message_worker_exceptions_total"));
        assert!(rendered.contains("message_worker_dispatches_total"));
        assert!(rendered.contains("message_worker_dead_lettered_total"));
    }
}

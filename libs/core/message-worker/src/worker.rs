//! The consumption loop.
//!
//! `MessageWorker` opens one subscription per binding of a
//! [`WorkerDescriptor`] and polls each of them on its own task:
//!
//! ```text
//! Stopped ─ run() ─> Starting ─ subscriptions open ─> Running
//!    ^                                                   │ cancellation
//!    └──────── pollers drained or grace elapsed ──── Stopping
//! ```
//!
//! Within one subscription a batch is dispatched sequentially before the next
//! receive. Completed messages are acknowledged when the binding has
//! `delete_after_read` and the handler did not settle them itself; faulted
//! messages are reported and abandoned for redelivery.

use crate::broker::{BrokerConnector, SubscriptionHandle, SubscriptionRequest};
use crate::codec::PayloadCodec;
use crate::config::WorkerConfig;
use crate::delivery::Delivery;
use crate::dispatcher::{Dispatcher, Outcome};
use crate::error::WorkerError;
use crate::message::InboundMessage;
use crate::metrics::WorkerMetrics;
use crate::registry::{BindingKey, HandlerBinding, WorkerDescriptor};
use crate::resilience::RetryPolicy;
use crate::telemetry::Telemetry;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use strum::{AsRefStr, Display};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the consumption loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum LoopState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// State shared with every poll task.
struct Shared {
    descriptor: Arc<WorkerDescriptor>,
    connector: Arc<dyn BrokerConnector>,
    telemetry: Arc<dyn Telemetry>,
    metrics: WorkerMetrics,
    config: WorkerConfig,
    settle_policy: RetryPolicy,
    open_subscriptions: AtomicUsize,
}

/// Drives the bindings of one worker descriptor against a broker connector.
pub struct MessageWorker {
    shared: Arc<Shared>,
    state: watch::Sender<LoopState>,
}

impl MessageWorker {
    /// Create a worker; fails if the settle retry policy is invalid.
    pub fn new(
        descriptor: Arc<WorkerDescriptor>,
        connector: Arc<dyn BrokerConnector>,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        let settle_policy = RetryPolicy::new(config.settle_retry.clone())?;
        let metrics = WorkerMetrics::new(descriptor.worker());
        let (state, _) = watch::channel(LoopState::Stopped);

        Ok(Self {
            shared: Arc::new(Shared {
                telemetry: Arc::new(metrics.clone()),
                descriptor,
                connector,
                metrics,
                config,
                settle_policy,
                open_subscriptions: AtomicUsize::new(0),
            }),
            state,
        })
    }

    /// Replace the telemetry sink (defaults to [`WorkerMetrics`]).
    ///
    /// Must be called before `run`.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.telemetry = telemetry;
        }
        self
    }

    pub fn descriptor(&self) -> &Arc<WorkerDescriptor> {
        &self.shared.descriptor
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Number of subscriptions currently being polled.
    pub fn open_subscriptions(&self) -> usize {
        self.shared.open_subscriptions.load(Ordering::Relaxed)
    }

    /// Run until `shutdown` becomes `true` (or its sender is dropped).
    ///
    /// Fails immediately if the loop is already running, and with
    /// [`WorkerError::NoSubscriptions`] if no binding could be subscribed.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let worker = self.shared.descriptor.worker();
        let claimed = self.state.send_if_modified(|state| {
            if *state == LoopState::Stopped {
                *state = LoopState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(WorkerError::AlreadyRunning(worker));
        }

        info!(
            worker,
            broker_config = self.shared.descriptor.broker_config(),
            connector = self.shared.connector.name(),
            bindings = self.shared.descriptor.bindings().len(),
            "Starting message worker"
        );
        self.shared.telemetry.report_event("worker_starting");

        let mut pollers = JoinSet::new();
        for (index, binding) in self.shared.descriptor.bindings().iter().enumerate() {
            let key = binding.key();
            let request = SubscriptionRequest::from(binding);

            match self.shared.connector.open_subscription(&request).await {
                Ok(handle) => {
                    info!(binding = %key, subscription = %handle.id, "Subscription opened");
                    self.shared.open_subscriptions.fetch_add(1, Ordering::Relaxed);
                    pollers.spawn(poll_subscription(
                        Arc::clone(&self.shared),
                        index,
                        handle,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    error!(binding = %key, error = %e, "Failed to open subscription, binding disabled");
                    self.shared.telemetry.report_exception(&e);
                }
            }
        }

        let open = self.open_subscriptions();
        self.shared.metrics.open_subscriptions(open);
        if open == 0 {
            self.state.send_replace(LoopState::Stopped);
            self.shared.telemetry.report_event("worker_stopped");
            return Err(WorkerError::NoSubscriptions(worker));
        }

        self.state.send_replace(LoopState::Running);
        self.shared.telemetry.report_event("worker_running");
        info!(worker, subscriptions = open, "Message worker running");

        let mut shutdown = shutdown;
        cancelled(&mut shutdown).await;

        self.state.send_replace(LoopState::Stopping);
        self.shared.telemetry.report_event("worker_stopping");
        info!(
            worker,
            grace_secs = self.shared.config.shutdown_grace.as_secs(),
            "Received shutdown signal, draining in-flight messages"
        );

        let drain = async {
            while let Some(joined) = pollers.join_next().await {
                if let Err(e) = joined {
                    error!(worker, error = %e, "Poll task ended abnormally");
                }
            }
        };
        if tokio::time::timeout(self.shared.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!(
                worker,
                remaining = pollers.len(),
                "Grace period elapsed, aborting in-flight dispatches"
            );
            pollers.abort_all();
        }

        self.shared.open_subscriptions.store(0, Ordering::Relaxed);
        self.shared.metrics.open_subscriptions(0);
        self.state.send_replace(LoopState::Stopped);
        self.shared.telemetry.report_event("worker_stopped");
        info!(worker, "Message worker stopped");
        Ok(())
    }
}

/// True once shutdown was requested or its sender is gone.
fn is_cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    let requested = *shutdown.borrow();
    requested || shutdown.has_changed().is_err()
}

/// Resolves once shutdown is requested.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if is_cancelled(shutdown) {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn poll_subscription(
    shared: Arc<Shared>,
    index: usize,
    handle: SubscriptionHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let binding = &shared.descriptor.bindings()[index];
    let key = binding.key();
    let mut consecutive_errors: u32 = 0;

    debug!(binding = %key, take = binding.take_quantity(), "Poll task started");

    loop {
        if is_cancelled(&shutdown) {
            break;
        }

        let received = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => break,
            received = shared.connector.receive(&handle) => received,
        };

        match received {
            Ok(batch) => {
                if consecutive_errors > 0 {
                    info!(binding = %key, errors = consecutive_errors, "Receive recovered");
                    consecutive_errors = 0;
                }
                if batch.is_empty() {
                    continue;
                }

                shared.metrics.messages_received(&key, batch.len());
                dispatch_batch(&shared, binding, &key, &handle, batch, &shutdown).await;
            }
            Err(e) => {
                consecutive_errors += 1;
                let backoff = shared.config.receive_backoff(consecutive_errors);
                warn!(
                    binding = %key,
                    error = %e,
                    consecutive_errors,
                    backoff_secs = backoff.as_secs(),
                    "Receive failed, backing off"
                );
                shared.telemetry.report_exception(&e);

                tokio::select! {
                    _ = cancelled(&mut shutdown) => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    shared.open_subscriptions.fetch_sub(1, Ordering::Relaxed);
    debug!(binding = %key, "Poll task stopped");
}

async fn dispatch_batch(
    shared: &Shared,
    binding: &HandlerBinding,
    key: &BindingKey,
    handle: &SubscriptionHandle,
    batch: Vec<InboundMessage>,
    shutdown: &watch::Receiver<bool>,
) {
    let mut pending = batch.into_iter();

    while let Some(message) = pending.next() {
        if is_cancelled(shutdown) {
            let remaining: Vec<InboundMessage> = std::iter::once(message).chain(pending).collect();
            info!(binding = %key, count = remaining.len(), "Shutdown requested, abandoning rest of batch");
            for message in remaining {
                abandon(shared, handle, key, &message).await;
            }
            return;
        }

        dispatch_one(shared, binding, key, handle, message).await;
    }
}

async fn dispatch_one(
    shared: &Shared,
    binding: &HandlerBinding,
    key: &BindingKey,
    handle: &SubscriptionHandle,
    message: InboundMessage,
) {
    let delivery = Delivery::new(
        Arc::clone(&shared.connector),
        handle.clone(),
        message.metadata.clone(),
        shared.settle_policy.clone(),
    );

    let started = Instant::now();
    let result = delivery
        .clone()
        .scope(Dispatcher::invoke(binding, &message.payload))
        .await;
    let elapsed = started.elapsed();

    match &result.outcome {
        Outcome::Completed => {
            shared.metrics.record_dispatch(key, "completed", elapsed);
            debug!(
                binding = %key,
                message_id = %message.message_id(),
                elapsed_ms = elapsed.as_millis() as u64,
                returned = %result.value.as_ref().map(PayloadCodec::encode_for_log).unwrap_or_default(),
                "Message handled"
            );

            if binding.delete_after_read() && !delivery.is_settled() {
                if let Err(e) = delivery.complete().await {
                    warn!(binding = %key, message_id = %message.message_id(), error = %e, "Failed to acknowledge message");
                    shared.telemetry.report_exception(&e);
                }
            }
        }
        Outcome::Faulted(err) => {
            shared.metrics.record_dispatch(key, err.kind(), elapsed);
            error!(
                binding = %key,
                handler = binding.handler_name(),
                message_id = %message.message_id(),
                delivery_count = message.metadata.delivery_count,
                payload = %PayloadCodec::raw_for_log(&message.payload),
                error = %err,
                "Dispatch faulted"
            );
            shared.telemetry.report_exception(err);

            if delivery.is_settled() {
                return;
            }
            if shared.config.should_dead_letter(message.metadata.delivery_count) {
                match delivery.dead_letter(&message, &err.to_string()).await {
                    Ok(()) => {
                        shared.metrics.message_dead_lettered(key);
                        warn!(
                            binding = %key,
                            message_id = %message.message_id(),
                            delivery_count = message.metadata.delivery_count,
                            "Delivery limit reached, message dead-lettered"
                        );
                    }
                    Err(e) => {
                        warn!(binding = %key, message_id = %message.message_id(), error = %e, "Failed to dead-letter message");
                        shared.telemetry.report_exception(&e);
                    }
                }
            } else if let Err(e) = delivery.abandon().await {
                warn!(binding = %key, message_id = %message.message_id(), error = %e, "Failed to abandon message");
                shared.telemetry.report_exception(&e);
            }
        }
    }
}

async fn abandon(shared: &Shared, handle: &SubscriptionHandle, key: &BindingKey, message: &InboundMessage) {
    let id = message.message_id();
    let connector = &shared.connector;
    let result = shared
        .settle_policy
        .execute(move || connector.abandon(handle, id))
        .await;

    if let Err(e) = result {
        warn!(binding = %key, message_id = %id, error = %e, "Failed to abandon message");
        shared.telemetry.report_exception(&e);
    }
}

//! Message Worker Framework
//!
//! Declarative message handlers bound to queues and topic subscriptions.
//!
//! ## Features
//!
//! - **Handler discovery**: a `Worker` declares its bindings once; the registry
//!   validates them and rejects duplicates
//! - **Typed dispatch**: JSON payloads are decoded into the handler argument,
//!   zero-argument handlers ignore the payload
//! - **Consumption loop**: one poll task per subscription, graceful shutdown
//!   with a grace period
//! - **Delivery control**: automatic acknowledgement or explicit
//!   `current_delivery().complete()` from inside a handler
//! - **Dead-lettering**: faulted messages move to `<entity>:dlq` after a
//!   bounded number of deliveries
//! - **Retry policy**: exponential or fixed backoff for broker and HTTP calls
//! - **Brokers**: Redis Streams consumer groups and an in-memory broker
//! - **Prometheus metrics** and K8s-ready health endpoints
//!
//! ## Example
//!
//! ```ignore
//! use message_worker::{HandlerRegistry, MessageWorker, Registrar, Worker, WorkerConfig};
//!
//! struct Orders;
//!
//! impl Orders {
//!     async fn on_placed(self: Arc<Self>, order: OrderPlaced) -> Result<(), BoxError> {
//!         /* ... */
//!     }
//! }
//!
//! impl Worker for Orders {
//!     const BROKER_CONFIG: &'static str = "orders";
//!
//!     fn register(r: &mut Registrar<Self>) {
//!         r.queue("orders:placed", Self::on_placed).delete_after_read();
//!     }
//! }
//!
//! let descriptor = registry.register(Arc::new(Orders))?;
//! let worker = MessageWorker::new(descriptor, connector, WorkerConfig::default())?;
//! worker.run(shutdown_rx).await?;
//! ```

mod broker;
mod codec;
mod config;
mod delivery;
mod dispatcher;
mod error;
mod handler;
mod health;
mod http;
mod memory;
mod message;
pub mod metrics;
mod registry;
mod resilience;
mod streams;
mod telemetry;
mod worker;

// Re-export main types
pub use broker::{
    BrokerConnector, MessagePublisher, SubscriptionHandle, SubscriptionRequest,
    dead_letter_destination, publish_json,
};
pub use codec::PayloadCodec;
pub use config::WorkerConfig;
pub use delivery::{Delivery, Settlement, current_delivery};
pub use dispatcher::{DispatchResult, Dispatcher, Outcome};
pub use error::{
    BoxError, BrokerError, CodecError, DispatchError, ErrorCategory, RegistryError, Transience,
    WorkerError,
};
pub use handler::{Handler, HandlerKind, HandlerOutput, SyncHandler, sync_handler};
pub use health::{HealthResponse, HealthState, health_router};
pub use http::{HttpError, ResilientHttpClient};
pub use memory::InMemoryBroker;
pub use message::{InboundMessage, MessageMetadata};
pub use metrics::{WorkerMetrics, init_metrics};
pub use registry::{
    BindingKey, BindingOptions, DEFAULT_TAKE_QUANTITY, HandlerBinding, HandlerRegistry, Registrar,
    SourceType, Worker, WorkerDescriptor,
};
pub use resilience::{MAX_RETRY_COUNT, RetryAttempt, RetryPolicy, RetryPolicyConfig};
pub use streams::RedisStreamsBroker;
pub use telemetry::{Telemetry, TracingTelemetry, exception_kind};
pub use worker::{LoopState, MessageWorker};

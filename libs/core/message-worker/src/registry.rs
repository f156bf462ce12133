//! Handler registry and binding discovery.
//!
//! This module provides:
//! - `Worker` trait that worker types implement to declare their bindings
//! - `Registrar` / `BindingOptions` used inside `Worker::register`
//! - `HandlerBinding` / `WorkerDescriptor` describing what was declared
//! - `HandlerRegistry` that validates and holds descriptors per worker type

use crate::error::RegistryError;
use crate::handler::{Handler, HandlerKind};
use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tracing::debug;

/// Messages pulled per receive when a binding does not say otherwise.
pub const DEFAULT_TAKE_QUANTITY: u32 = 10;

/// Kind of broker source a binding consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SourceType {
    /// Point-to-point queue.
    Queue,
    /// Publish/subscribe topic, consumed through a named subscription.
    Topic,
}

/// Identity of a binding within one worker type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingKey {
    pub source: SourceType,
    pub name: String,
    pub subscription: Option<String>,
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subscription {
            Some(subscription) => write!(f, "{}:{}/{}", self.source, self.name, subscription),
            None => write!(f, "{}:{}", self.source, self.name),
        }
    }
}

/// Association between a handler and the broker source it consumes.
#[derive(Debug, Clone)]
pub struct HandlerBinding {
    handler: HandlerKind,
    handler_name: &'static str,
    source: SourceType,
    name: String,
    subscription: Option<String>,
    take_quantity: u32,
    delete_after_read: bool,
    filter: Option<String>,
}

impl HandlerBinding {
    fn new(
        handler: HandlerKind,
        handler_name: &'static str,
        source: SourceType,
        name: String,
        subscription: Option<String>,
    ) -> Self {
        Self {
            handler,
            handler_name,
            source,
            name,
            subscription,
            take_quantity: DEFAULT_TAKE_QUANTITY,
            delete_after_read: false,
            filter: None,
        }
    }

    pub fn key(&self) -> BindingKey {
        BindingKey {
            source: self.source,
            name: self.name.clone(),
            subscription: self.subscription.clone(),
        }
    }

    pub fn handler(&self) -> &HandlerKind {
        &self.handler
    }

    /// Fully qualified name of the handler function.
    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    pub fn source(&self) -> SourceType {
        self.source
    }

    /// Queue or topic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscription(&self) -> Option<&str> {
        self.subscription.as_deref()
    }

    pub fn take_quantity(&self) -> u32 {
        self.take_quantity
    }

    pub fn delete_after_read(&self) -> bool {
        self.delete_after_read
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err(format!("{} name is empty", self.source));
        }
        match (self.source, self.subscription.as_deref()) {
            (SourceType::Topic, None) => return Err("topic binding has no subscription".into()),
            (SourceType::Topic, Some(sub)) if sub.trim().is_empty() => {
                return Err("subscription name is empty".into());
            }
            (SourceType::Queue, Some(_)) => {
                return Err("queue binding cannot name a subscription".into());
            }
            _ => {}
        }
        if self.source == SourceType::Queue && self.filter.is_some() {
            return Err("filter expressions apply to topic subscriptions only".into());
        }
        if self.take_quantity == 0 {
            return Err("take quantity must be greater than zero".into());
        }
        Ok(())
    }
}

/// Bindings of one worker type against one broker configuration.
///
/// Built once by discovery and never mutated afterwards.
#[derive(Debug)]
pub struct WorkerDescriptor {
    worker: &'static str,
    broker_config: &'static str,
    bindings: Vec<HandlerBinding>,
}

impl WorkerDescriptor {
    pub fn worker(&self) -> &'static str {
        self.worker
    }

    /// Tag naming the broker configuration the worker consumes from.
    pub fn broker_config(&self) -> &'static str {
        self.broker_config
    }

    /// Bindings in declaration order.
    pub fn bindings(&self) -> &[HandlerBinding] {
        &self.bindings
    }

    pub fn binding(&self, key: &BindingKey) -> Option<&HandlerBinding> {
        self.bindings.iter().find(|b| b.key() == *key)
    }
}

/// A worker type: a set of handlers consuming from one broker configuration.
///
/// # Example
///
/// ```rust,ignore
/// use message_worker::{Registrar, Worker};
///
/// impl Worker for OrdersWorker {
///     const BROKER_CONFIG: &'static str = "orders";
///
///     fn register(r: &mut Registrar<Self>) {
///         r.queue("orders:placed", Self::on_placed).take(20).delete_after_read();
///         r.topic("orders:events", "audit", Self::on_event);
///     }
/// }
/// ```
pub trait Worker: Send + Sync + Sized + 'static {
    /// Broker configuration tag.
    const BROKER_CONFIG: &'static str;

    /// Declare the worker's bindings.
    fn register(registrar: &mut Registrar<Self>);

    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Collects binding declarations for a worker instance.
pub struct Registrar<W> {
    worker: Arc<W>,
    bindings: Vec<HandlerBinding>,
}

impl<W: Worker> Registrar<W> {
    fn new(worker: Arc<W>) -> Self {
        Self {
            worker,
            bindings: Vec::new(),
        }
    }

    /// Bind `handler` to a queue.
    pub fn queue<M, H>(&mut self, name: impl Into<String>, handler: H) -> BindingOptions<'_>
    where
        H: Handler<W, M>,
    {
        self.push(SourceType::Queue, name.into(), None, handler)
    }

    /// Bind `handler` to a subscription of a topic.
    pub fn topic<M, H>(
        &mut self,
        topic: impl Into<String>,
        subscription: impl Into<String>,
        handler: H,
    ) -> BindingOptions<'_>
    where
        H: Handler<W, M>,
    {
        self.push(
            SourceType::Topic,
            topic.into(),
            Some(subscription.into()),
            handler,
        )
    }

    fn push<M, H>(
        &mut self,
        source: SourceType,
        name: String,
        subscription: Option<String>,
        handler: H,
    ) -> BindingOptions<'_>
    where
        H: Handler<W, M>,
    {
        let handler_name = std::any::type_name::<H>();
        let kind = handler.into_kind(Arc::clone(&self.worker));
        self.bindings.push(HandlerBinding::new(
            kind,
            handler_name,
            source,
            name,
            subscription,
        ));
        let index = self.bindings.len() - 1;
        BindingOptions {
            binding: &mut self.bindings[index],
        }
    }
}

/// Optional settings of a binding being declared.
pub struct BindingOptions<'a> {
    binding: &'a mut HandlerBinding,
}

impl BindingOptions<'_> {
    /// Maximum number of messages pulled per receive.
    pub fn take(self, quantity: u32) -> Self {
        self.binding.take_quantity = quantity;
        self
    }

    /// Acknowledge messages as soon as the handler completes.
    pub fn delete_after_read(self) -> Self {
        self.binding.delete_after_read = true;
        self
    }

    /// Broker-side filter expression for a topic subscription.
    pub fn filter(self, expression: impl Into<String>) -> Self {
        self.binding.filter = Some(expression.into());
        self
    }
}

/// Holds one validated descriptor per registered worker type.
#[derive(Default)]
pub struct HandlerRegistry {
    workers: Vec<(TypeId, Arc<WorkerDescriptor>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `W::register` and validate the declared bindings.
    ///
    /// Pure: performs no I/O and can be repeated with the same result.
    pub fn discover<W: Worker>(worker: Arc<W>) -> Result<WorkerDescriptor, RegistryError> {
        let mut registrar = Registrar::new(worker);
        W::register(&mut registrar);

        let mut seen = HashSet::with_capacity(registrar.bindings.len());
        for binding in &registrar.bindings {
            let key = binding.key();
            binding
                .validate()
                .map_err(|reason| RegistryError::InvalidBinding {
                    worker: W::name(),
                    key: key.clone(),
                    reason,
                })?;
            if !seen.insert(key.clone()) {
                return Err(RegistryError::DuplicateBinding {
                    worker: W::name(),
                    key,
                });
            }
        }

        debug!(
            worker = W::name(),
            broker_config = W::BROKER_CONFIG,
            bindings = registrar.bindings.len(),
            "Discovered worker bindings"
        );

        Ok(WorkerDescriptor {
            worker: W::name(),
            broker_config: W::BROKER_CONFIG,
            bindings: registrar.bindings,
        })
    }

    /// Discover `W` and keep its descriptor.
    pub fn register<W: Worker>(
        &mut self,
        worker: Arc<W>,
    ) -> Result<Arc<WorkerDescriptor>, RegistryError> {
        let type_id = TypeId::of::<W>();
        if self.workers.iter().any(|(id, _)| *id == type_id) {
            return Err(RegistryError::WorkerAlreadyRegistered(W::name()));
        }

        let descriptor = Arc::new(Self::discover(worker)?);
        self.workers.push((type_id, Arc::clone(&descriptor)));
        Ok(descriptor)
    }

    pub fn get<W: Worker>(&self) -> Option<Arc<WorkerDescriptor>> {
        let type_id = TypeId::of::<W>();
        self.workers
            .iter()
            .find(|(id, _)| *id == type_id)
            .map(|(_, descriptor)| Arc::clone(descriptor))
    }

    /// Registered descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<WorkerDescriptor>> {
        self.workers.iter().map(|(_, descriptor)| descriptor)
    }
}

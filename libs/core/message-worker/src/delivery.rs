//! Explicit settlement of the message being handled.
//!
//! While a handler runs, [`current_delivery`] returns the [`Delivery`] for its
//! message. A handler bound without `delete_after_read` completes the message
//! itself; any handler may abandon it to request redelivery. A faulted
//! message that has used up its deliveries is dead-lettered by the loop.
//!
//! ```rust,ignore
//! async fn on_order(self: Arc<Self>, order: Order) -> Result<(), OrderError> {
//!     self.store.save(&order).await?;
//!     if let Some(delivery) = message_worker::current_delivery() {
//!         delivery.complete().await?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::broker::{BrokerConnector, SubscriptionHandle};
use crate::error::BrokerError;
use crate::message::{InboundMessage, MessageMetadata};
use crate::resilience::RetryPolicy;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use strum::Display;
use tracing::debug;

tokio::task_local! {
    static CURRENT_DELIVERY: Delivery;
}

/// Settlement state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Settlement {
    Pending,
    Completed,
    Abandoned,
    DeadLettered,
}

impl Settlement {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Settlement::Completed,
            2 => Settlement::Abandoned,
            3 => Settlement::DeadLettered,
            _ => Settlement::Pending,
        }
    }
}

#[derive(Clone, Copy)]
enum SettleOp<'a> {
    Acknowledge,
    Abandon,
    DeadLetter {
        message: &'a InboundMessage,
        reason: &'a str,
    },
}

impl SettleOp<'_> {
    fn target(&self) -> Settlement {
        match self {
            SettleOp::Acknowledge => Settlement::Completed,
            SettleOp::Abandon => Settlement::Abandoned,
            SettleOp::DeadLetter { .. } => Settlement::DeadLettered,
        }
    }
}

struct Inner {
    connector: Arc<dyn BrokerConnector>,
    handle: SubscriptionHandle,
    metadata: MessageMetadata,
    state: AtomicU8,
    policy: RetryPolicy,
}

/// A received message awaiting settlement. Cheap to clone.
#[derive(Clone)]
pub struct Delivery {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.inner.metadata.message_id)
            .field("subscription", &self.inner.handle.id)
            .field("settlement", &self.settlement())
            .finish()
    }
}

impl Delivery {
    pub(crate) fn new(
        connector: Arc<dyn BrokerConnector>,
        handle: SubscriptionHandle,
        metadata: MessageMetadata,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                handle,
                metadata,
                state: AtomicU8::new(Settlement::Pending as u8),
                policy,
            }),
        }
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.inner.metadata
    }

    pub fn message_id(&self) -> &str {
        &self.inner.metadata.message_id
    }

    pub fn settlement(&self) -> Settlement {
        Settlement::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_settled(&self) -> bool {
        self.settlement() != Settlement::Pending
    }

    /// Acknowledge the message. A second call, or a call after abandon, is a no-op.
    pub async fn complete(&self) -> Result<(), BrokerError> {
        self.settle(SettleOp::Acknowledge).await
    }

    /// Release the message for redelivery. No-op once settled.
    pub async fn abandon(&self) -> Result<(), BrokerError> {
        self.settle(SettleOp::Abandon).await
    }

    /// Move the message to its dead-letter destination and remove it. No-op once settled.
    pub(crate) async fn dead_letter(
        &self,
        message: &InboundMessage,
        reason: &str,
    ) -> Result<(), BrokerError> {
        self.settle(SettleOp::DeadLetter { message, reason }).await
    }

    async fn settle(&self, op: SettleOp<'_>) -> Result<(), BrokerError> {
        let target = op.target();
        let claimed = self.inner.state.compare_exchange(
            Settlement::Pending as u8,
            target as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Err(current) = claimed {
            debug!(
                message_id = %self.message_id(),
                settlement = %Settlement::from_u8(current),
                "Message already settled"
            );
            return Ok(());
        }

        let inner = &self.inner;
        let id = inner.metadata.message_id.as_str();
        let result = inner
            .policy
            .execute(move || async move {
                match op {
                    SettleOp::Acknowledge => inner.connector.acknowledge(&inner.handle, id).await,
                    SettleOp::Abandon => inner.connector.abandon(&inner.handle, id).await,
                    SettleOp::DeadLetter { message, reason } => {
                        inner.connector.dead_letter(&inner.handle, message, reason).await
                    }
                }
            })
            .await;

        if result.is_err() {
            // Leave it pending so a later attempt (or the loop) can settle it
            inner.state.store(Settlement::Pending as u8, Ordering::Release);
        }
        result
    }

    /// Run `fut` with this delivery installed as the current one.
    pub(crate) async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT_DELIVERY.scope(self, fut).await
    }
}

/// The delivery of the message currently being handled, if called from inside a handler.
pub fn current_delivery() -> Option<Delivery> {
    CURRENT_DELIVERY.try_with(Clone::clone).ok()
}

//! Order message handlers.

use message_worker::{
    BoxError, HttpError, Registrar, ResilientHttpClient, Worker, current_delivery, sync_handler,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info};

pub const PLACED_QUEUE: &str = "orders:placed";
pub const EVENTS_TOPIC: &str = "orders:events";
pub const AUDIT_SUBSCRIPTION: &str = "audit";
pub const HEARTBEAT_QUEUE: &str = "orders:heartbeat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub customer: String,
    pub total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub accepted: bool,
}

#[derive(Error, Debug)]
pub enum OrderError {
    #[error("Order {order_id} has a non-positive total ({total_cents})")]
    InvalidTotal { order_id: String, total_cents: i64 },

    #[error("Webhook failed: {0}")]
    Webhook(#[from] HttpError),
}

/// Handles placed orders, audits order events and answers heartbeats.
pub struct OrdersWorker {
    webhook: Option<(ResilientHttpClient, String)>,
    processed: AtomicU64,
}

impl OrdersWorker {
    pub fn new() -> Self {
        Self {
            webhook: None,
            processed: AtomicU64::new(0),
        }
    }

    /// Notify `url` with every accepted order.
    pub fn with_webhook(mut self, client: ResilientHttpClient, url: impl Into<String>) -> Self {
        self.webhook = Some((client, url.into()));
        self
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    async fn on_placed(self: Arc<Self>, order: OrderPlaced) -> Result<OrderReceipt, OrderError> {
        if order.total_cents <= 0 {
            return Err(OrderError::InvalidTotal {
                order_id: order.order_id,
                total_cents: order.total_cents,
            });
        }

        if let Some((client, url)) = &self.webhook {
            let _: serde_json::Value = client.post_json(url, &order).await?;
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
        info!(order_id = %order.order_id, customer = %order.customer, "Order accepted");

        Ok(OrderReceipt {
            order_id: order.order_id,
            accepted: true,
        })
    }

    /// Audit events are settled explicitly once recorded.
    async fn on_event(self: Arc<Self>, event: serde_json::Value) -> Result<(), BoxError> {
        let delivery = current_delivery().ok_or("audit handler invoked outside a delivery")?;
        info!(
            message_id = %delivery.message_id(),
            event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("unknown"),
            "Order event audited"
        );
        delivery.complete().await?;
        Ok(())
    }

    fn on_heartbeat(self: Arc<Self>) -> Result<(), Infallible> {
        debug!(processed = self.processed(), "Heartbeat");
        Ok(())
    }
}

impl Default for OrdersWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for OrdersWorker {
    const BROKER_CONFIG: &'static str = "orders";

    fn register(r: &mut Registrar<Self>) {
        r.queue(PLACED_QUEUE, Self::on_placed)
            .take(20)
            .delete_after_read();
        r.topic(EVENTS_TOPIC, AUDIT_SUBSCRIPTION, Self::on_event);
        r.queue(HEARTBEAT_QUEUE, sync_handler(Self::on_heartbeat))
            .delete_after_read();
    }

    fn name() -> &'static str {
        "orders"
    }
}

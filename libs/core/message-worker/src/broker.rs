//! Broker connector and publisher contracts.
//!
//! The consumption loop only talks to a broker through [`BrokerConnector`].
//! Two implementations ship with the crate: [`InMemoryBroker`](crate::InMemoryBroker)
//! and [`RedisStreamsBroker`](crate::RedisStreamsBroker).

use crate::codec::PayloadCodec;
use crate::error::BrokerError;
use crate::message::InboundMessage;
use crate::registry::HandlerBinding;
use crate::resilience::RetryPolicy;
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

/// What to subscribe to, taken from a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Queue or topic name
    pub name: String,
    /// Subscription name (topics only)
    pub subscription: Option<String>,
    /// Broker-side filter expression (topics only)
    pub filter: Option<String>,
    /// Maximum messages per receive
    pub take_quantity: u32,
}

impl From<&HandlerBinding> for SubscriptionRequest {
    fn from(binding: &HandlerBinding) -> Self {
        Self {
            name: binding.name().to_string(),
            subscription: binding.subscription().map(str::to_string),
            filter: binding.filter().map(str::to_string),
            take_quantity: binding.take_quantity(),
        }
    }
}

/// An open subscription, as returned by [`BrokerConnector::open_subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    /// Connector-assigned identifier
    pub id: String,
    /// Queue or topic name
    pub entity: String,
    pub subscription: Option<String>,
    pub take_quantity: u32,
}

impl SubscriptionHandle {
    pub fn new(request: &SubscriptionRequest, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity: request.name.clone(),
            subscription: request.subscription.clone(),
            take_quantity: request.take_quantity,
        }
    }
}

/// Transport-specific receive side of a broker.
///
/// Implementations must be safe for concurrent use from every poll task.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a subscription for one binding.
    async fn open_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionHandle, BrokerError>;

    /// Receive up to `take_quantity` messages, waiting until some are
    /// available or the connector's receive timeout elapses (empty batch).
    async fn receive(&self, handle: &SubscriptionHandle) -> Result<Vec<InboundMessage>, BrokerError>;

    /// Remove a processed message.
    async fn acknowledge(&self, handle: &SubscriptionHandle, message_id: &str)
    -> Result<(), BrokerError>;

    /// Release a message so it can be redelivered.
    async fn abandon(&self, handle: &SubscriptionHandle, message_id: &str) -> Result<(), BrokerError>;

    /// Copy a message to the dead-letter destination of its entity, then
    /// remove it from the subscription.
    async fn dead_letter(
        &self,
        handle: &SubscriptionHandle,
        message: &InboundMessage,
        reason: &str,
    ) -> Result<(), BrokerError>;

    /// Connector name for logs.
    fn name(&self) -> &'static str;
}

/// Dead-letter destination for a queue or topic.
pub fn dead_letter_destination(entity: &str) -> String {
    format!("{}:dlq", entity)
}

/// Send side of a broker.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish a raw payload to a queue or topic; returns the message ID.
    async fn publish(&self, destination: &str, payload: Vec<u8>) -> Result<String, BrokerError>;
}

/// Encode `value` as JSON and publish it, retrying transient broker failures.
pub async fn publish_json<P, T>(
    publisher: &P,
    policy: &RetryPolicy,
    destination: &str,
    value: &T,
) -> Result<String, BrokerError>
where
    P: MessagePublisher + ?Sized,
    T: Serialize + ?Sized,
{
    let payload = PayloadCodec::encode(value)?;
    let message_id = policy
        .execute(move || publisher.publish(destination, payload.clone()))
        .await?;

    debug!(destination, message_id = %message_id, "Published message");
    Ok(message_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::Serialize;

    #[derive(Default)]
    struct FlakyPublisher {
        failures_left: Mutex<u32>,
        sent: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl MessagePublisher for FlakyPublisher {
        async fn publish(&self, destination: &str, payload: Vec<u8>) -> Result<String, BrokerError> {
            {
                let mut left = self.failures_left.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(BrokerError::Unavailable("connection reset".into()));
                }
            }
            let mut sent = self.sent.lock();
            sent.push((destination.to_string(), payload));
            Ok(format!("{}-0", sent.len()))
        }
    }

    #[derive(Serialize)]
    struct Placed {
        order_id: u64,
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_json_retries_transient() {
        let publisher = FlakyPublisher {
            failures_left: Mutex::new(2),
            ..Default::default()
        };
        let policy = RetryPolicy::new(crate::RetryPolicyConfig::fixed(3, 1)).unwrap();

        let id = publish_json(&publisher, &policy, "orders", &Placed { order_id: 7 })
            .await
            .unwrap();

        assert_eq!(id, "1-0");
        let sent = publisher.sent.lock();
        assert_eq!(sent[0].0, "orders");
        assert_eq!(sent[0].1, br#"{"order_id":7}"#);
    }

    #[tokio::test]
    async fn test_publish_json_gives_up_after_retries() {
        let publisher = FlakyPublisher {
            failures_left: Mutex::new(5),
            ..Default::default()
        };

        let err = publish_json(&publisher, &RetryPolicy::no_retry(), "orders", &1u8)
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Unavailable(_)));
        assert!(publisher.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_mock_connector_contract() {
        let mut connector = MockBrokerConnector::new();
        connector
            .expect_open_subscription()
            .returning(|request| Ok(SubscriptionHandle::new(request, "sub-1")));
        connector.expect_name().return_const("mock");

        let request = SubscriptionRequest {
            name: "orders".into(),
            subscription: None,
            filter: None,
            take_quantity: 4,
        };
        let handle = connector.open_subscription(&request).await.unwrap();

        assert_eq!(handle.id, "sub-1");
        assert_eq!(handle.entity, "orders");
        assert_eq!(handle.take_quantity, 4);
        assert_eq!(connector.name(), "mock");
    }
}

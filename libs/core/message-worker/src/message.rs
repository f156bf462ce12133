//! Inbound message wrapper
//!
//! Raw payload plus the broker metadata needed to settle it.

use chrono::{DateTime, Utc};

/// Broker metadata attached to a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Broker-assigned message ID (e.g. a Redis stream entry ID "1234567890123-0")
    pub message_id: String,

    /// Declared content type, when the broker carries one
    pub content_type: Option<String>,

    /// When the broker accepted the message
    pub enqueued_at: DateTime<Utc>,

    /// Number of times this message has been delivered
    pub delivery_count: u32,
}

/// A message received from a broker, valid for a single dispatch cycle
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Raw payload bytes (UTF-8 JSON by convention)
    pub payload: Vec<u8>,

    /// Broker metadata
    pub metadata: MessageMetadata,
}

impl InboundMessage {
    /// Create a new message enqueued now
    pub fn new(message_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            metadata: MessageMetadata {
                message_id: message_id.into(),
                content_type: None,
                enqueued_at: Utc::now(),
                delivery_count: 1,
            },
        }
    }

    /// Set the content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.metadata.content_type = Some(content_type.into());
        self
    }

    /// Set the enqueue time
    pub fn with_enqueued_at(mut self, enqueued_at: DateTime<Utc>) -> Self {
        self.metadata.enqueued_at = enqueued_at;
        self
    }

    /// Set the delivery count
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.metadata.delivery_count = delivery_count;
        self
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        &self.metadata.message_id
    }

    /// Check if this is a redelivery
    pub fn is_redelivery(&self) -> bool {
        self.metadata.delivery_count > 1
    }

    /// Get age in milliseconds
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.metadata.enqueued_at).num_milliseconds()
    }
}

/// Parse the enqueue timestamp from a Redis stream ID
///
/// Stream IDs are in format "timestamp_ms-sequence"
pub(crate) fn parse_stream_timestamp(stream_id: &str) -> DateTime<Utc> {
    stream_id
        .split('-')
        .next()
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_timestamp() {
        let now_ms = Utc::now().timestamp_millis();
        let parsed = parse_stream_timestamp(&format!("{}-0", now_ms));
        assert_eq!(parsed.timestamp_millis(), now_ms);
    }

    #[test]
    fn test_parse_stream_timestamp_falls_back_to_now() {
        let parsed = parse_stream_timestamp("not-an-id");
        assert!((Utc::now() - parsed).num_seconds() < 5);
    }

    #[test]
    fn test_redelivery() {
        let message = InboundMessage::new("1234567890123-0", b"{}".to_vec())
            .with_content_type("application/json")
            .with_delivery_count(3);

        assert!(message.is_redelivery());
        assert_eq!(message.message_id(), "1234567890123-0");
        assert_eq!(
            message.metadata.content_type.as_deref(),
            Some("application/json")
        );
    }

    #[test]
    fn test_fresh_message() {
        let message = InboundMessage::new("m-1", Vec::new());
        assert!(!message.is_redelivery());
        assert!(message.age_ms() < 1000);
    }
}

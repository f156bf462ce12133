//! Redis Streams broker
//!
//! Maps bindings onto streams and consumer groups:
//!
//! | Binding                     | Stream   | Consumer group        | Starts at |
//! |-----------------------------|----------|-----------------------|-----------|
//! | queue `orders`              | `orders` | `orders:consumers`    | `0`       |
//! | topic `events`, sub `audit` | `events` | `events:audit`        | `$`       |
//!
//! Every entry carries a `payload` field (UTF-8 JSON) and a `content_type`
//! field. Entries left unacknowledged for longer than the claim idle time are
//! reclaimed with `XPENDING IDLE` + `XCLAIM` and redelivered. Abandoning an
//! entry backdates its idle time so it is reclaimed once the redelivery delay
//! has passed. Dead-lettered entries are copied to `<stream>:dlq` and
//! acknowledged in one transaction.
//!
//! Each subscription reads over its own connection, so a blocking
//! `XREADGROUP` never holds up acknowledgements on the shared command
//! connection. Reader connections time out `block_ms` after the command
//! response timeout.

use crate::broker::{
    BrokerConnector, MessagePublisher, SubscriptionHandle, SubscriptionRequest,
    dead_letter_destination,
};
use crate::error::BrokerError;
use crate::message::{InboundMessage, parse_stream_timestamp};
use async_trait::async_trait;
use chrono::Utc;
use core_config::redis::RedisConfig;
use core_config::worker::WorkerSettings;
use parking_lot::Mutex;
use redis::RedisResult;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONNECTOR: &str = "redis-streams";
const PAYLOAD_FIELD: &str = "payload";
const CONTENT_TYPE_FIELD: &str = "content_type";
const JSON_CONTENT_TYPE: &str = "application/json";

type StreamEntries = Vec<(String, Vec<(String, Vec<u8>)>)>;
type ReadReply = Vec<(String, StreamEntries)>;

/// Broker connector and publisher over Redis Streams.
#[derive(Clone)]
pub struct RedisStreamsBroker {
    client: redis::Client,
    redis: ConnectionManager,
    /// Blocking-read connection per subscription, keyed by consumer group
    readers: Arc<Mutex<HashMap<String, ConnectionManager>>>,
    response_timeout: Duration,
    consumer_id: String,
    block_ms: u64,
    claim_idle_ms: u64,
    redelivery_delay_ms: u64,
    max_length: i64,
}

impl RedisStreamsBroker {
    /// Open the command connection. Every command on it times out after
    /// `response_timeout`.
    pub async fn connect(
        client: redis::Client,
        response_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let redis = open_connection(&client, response_timeout).await?;
        let settings = WorkerSettings::default();

        Ok(Self {
            client,
            redis,
            readers: Arc::new(Mutex::new(HashMap::new())),
            response_timeout,
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            block_ms: settings.receive_block_ms,
            claim_idle_ms: settings.claim_idle_ms,
            redelivery_delay_ms: settings.redelivery_delay_ms,
            max_length: 100_000,
        })
    }

    /// Connect with loaded settings.
    pub async fn from_settings(
        client: redis::Client,
        redis_config: &RedisConfig,
        settings: &WorkerSettings,
    ) -> Result<Self, BrokerError> {
        let response_timeout = Duration::from_millis(redis_config.response_timeout_ms);
        Ok(Self::connect(client, response_timeout)
            .await?
            .with_block_ms(settings.receive_block_ms)
            .with_claim_idle_ms(settings.claim_idle_ms)
            .with_redelivery_delay_ms(settings.redelivery_delay_ms)
            .with_max_length(redis_config.max_stream_length))
    }

    /// Set the consumer name used within every group
    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    /// Set how long `XREADGROUP` blocks
    pub fn with_block_ms(mut self, block_ms: u64) -> Self {
        self.block_ms = block_ms;
        self
    }

    /// Set the idle time after which pending entries are reclaimed
    pub fn with_claim_idle_ms(mut self, claim_idle_ms: u64) -> Self {
        self.claim_idle_ms = claim_idle_ms;
        self
    }

    /// Set how long an abandoned entry waits before it is reclaimed
    pub fn with_redelivery_delay_ms(mut self, delay_ms: u64) -> Self {
        self.redelivery_delay_ms = delay_ms;
        self
    }

    /// Set the approximate `MAXLEN` applied on publish and dead-lettering
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if is_busy_group(&e) => {
                debug!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(BrokerError::Redis(e)),
        }
    }

    /// Connection used for blocking reads on `group`, opened on first use.
    async fn reader(&self, group: &str) -> Result<ConnectionManager, BrokerError> {
        let existing = self.readers.lock().get(group).cloned();
        if let Some(conn) = existing {
            return Ok(conn);
        }

        let timeout = read_timeout(self.block_ms, self.response_timeout);
        let conn = open_connection(&self.client, timeout).await?;
        debug!(group = %group, timeout_ms = timeout.as_millis() as u64, "Opened reader connection");
        Ok(self
            .readers
            .lock()
            .entry(group.to_string())
            .or_insert(conn)
            .clone())
    }

    /// Claim entries idle for longer than the claim idle time.
    async fn claim_idle(&self, handle: &SubscriptionHandle) -> Result<Vec<InboundMessage>, BrokerError> {
        let mut conn = self.redis.clone();

        let pending: RedisResult<Vec<(String, String, u64, u32)>> = redis::cmd("XPENDING")
            .arg(&handle.entity)
            .arg(&handle.id)
            .arg("IDLE")
            .arg(self.claim_idle_ms)
            .arg("-")
            .arg("+")
            .arg(handle.take_quantity)
            .query_async(&mut conn)
            .await;

        let deliveries: HashMap<String, u32> = match pending {
            Ok(pending) => pending
                .into_iter()
                .map(|(id, _, _, delivered)| (id, delivered))
                .collect(),
            Err(e) if is_no_group(&e) => return Ok(Vec::new()),
            Err(e) => return Err(BrokerError::Redis(e)),
        };

        if deliveries.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&handle.entity)
            .arg(&handle.id)
            .arg(&self.consumer_id)
            .arg(self.claim_idle_ms);
        for id in deliveries.keys() {
            cmd.arg(id);
        }

        let entries: StreamEntries = cmd.query_async(&mut conn).await?;
        let mut messages = parse_entries(entries);
        for message in &mut messages {
            // XCLAIM itself counts as one more delivery
            if let Some(delivered) = deliveries.get(message.message_id()) {
                message.metadata.delivery_count = delivered + 1;
            }
        }

        if !messages.is_empty() {
            warn!(
                stream = %handle.entity,
                group = %handle.id,
                count = messages.len(),
                "Claimed idle messages"
            );
        }
        Ok(messages)
    }

    async fn read_new(&self, handle: &SubscriptionHandle) -> Result<Vec<InboundMessage>, BrokerError> {
        let mut conn = self.reader(&handle.id).await?;

        let result: RedisResult<Option<ReadReply>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&handle.id)
            .arg(&self.consumer_id)
            .arg("BLOCK")
            .arg(self.block_ms)
            .arg("COUNT")
            .arg(handle.take_quantity)
            .arg("STREAMS")
            .arg(&handle.entity)
            .arg(">")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(streams)) => Ok(streams
                .into_iter()
                .flat_map(|(_, entries)| parse_entries(entries))
                .collect()),
            Ok(None) => Ok(Vec::new()),
            Err(e) if is_no_group(&e) => {
                // Stream or group deleted underneath us
                warn!(stream = %handle.entity, group = %handle.id, "Consumer group missing, recreating");
                self.ensure_group(&handle.entity, &handle.id, "0").await?;
                Ok(Vec::new())
            }
            Err(e) => Err(BrokerError::Redis(e)),
        }
    }
}

#[async_trait]
impl BrokerConnector for RedisStreamsBroker {
    async fn open_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionHandle, BrokerError> {
        if let Some(filter) = &request.filter {
            return Err(BrokerError::Unsupported {
                connector: CONNECTOR,
                what: format!("filter expression '{}'", filter),
            });
        }

        let group = group_name(&request.name, request.subscription.as_deref());
        let start = if request.subscription.is_some() { "$" } else { "0" };
        self.ensure_group(&request.name, &group, start).await?;
        self.reader(&group).await?;

        Ok(SubscriptionHandle::new(request, group))
    }

    async fn receive(&self, handle: &SubscriptionHandle) -> Result<Vec<InboundMessage>, BrokerError> {
        let claimed = self.claim_idle(handle).await?;
        if !claimed.is_empty() {
            return Ok(claimed);
        }
        self.read_new(handle).await
    }

    async fn acknowledge(&self, handle: &SubscriptionHandle, message_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();

        let _: i64 = redis::cmd("XACK")
            .arg(&handle.entity)
            .arg(&handle.id)
            .arg(message_id)
            .query_async(&mut conn)
            .await?;

        debug!(stream_id = %message_id, group = %handle.id, "Acknowledged message");
        Ok(())
    }

    async fn abandon(&self, handle: &SubscriptionHandle, message_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();

        let _: redis::Value = redis::cmd("XCLAIM")
            .arg(&handle.entity)
            .arg(&handle.id)
            .arg(&self.consumer_id)
            .arg(0)
            .arg(message_id)
            .arg("IDLE")
            .arg(abandon_idle_ms(self.claim_idle_ms, self.redelivery_delay_ms))
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;

        debug!(
            stream_id = %message_id,
            group = %handle.id,
            delay_ms = self.redelivery_delay_ms,
            "Abandoned message"
        );
        Ok(())
    }

    async fn dead_letter(
        &self,
        handle: &SubscriptionHandle,
        message: &InboundMessage,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let dlq = dead_letter_destination(&handle.entity);
        let message_id = message.message_id();

        let _: () = redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&dlq)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&message.payload)
            .arg(CONTENT_TYPE_FIELD)
            .arg(message.metadata.content_type.as_deref().unwrap_or(JSON_CONTENT_TYPE))
            .arg("original_id")
            .arg(message_id)
            .arg("group")
            .arg(&handle.id)
            .arg("delivery_count")
            .arg(message.metadata.delivery_count)
            .arg("error")
            .arg(reason)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .ignore()
            .cmd("XACK")
            .arg(&handle.entity)
            .arg(&handle.id)
            .arg(message_id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        info!(
            stream_id = %message_id,
            group = %handle.id,
            dlq = %dlq,
            delivery_count = message.metadata.delivery_count,
            "Moved message to DLQ"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        CONNECTOR
    }
}

#[async_trait]
impl MessagePublisher for RedisStreamsBroker {
    async fn publish(&self, destination: &str, payload: Vec<u8>) -> Result<String, BrokerError> {
        let mut conn = self.redis.clone();

        // Approximate trim
        let stream_id: String = redis::cmd("XADD")
            .arg(destination)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .arg(CONTENT_TYPE_FIELD)
            .arg(JSON_CONTENT_TYPE)
            .query_async(&mut conn)
            .await?;

        debug!(stream = %destination, stream_id = %stream_id, "Published message");
        Ok(stream_id)
    }
}

async fn open_connection(
    client: &redis::Client,
    response_timeout: Duration,
) -> Result<ConnectionManager, BrokerError> {
    let config = ConnectionManagerConfig::new().set_response_timeout(Some(response_timeout));
    Ok(ConnectionManager::new_with_config(client.clone(), config).await?)
}

/// Response timeout for a connection whose reads block for `block_ms`.
fn read_timeout(block_ms: u64, response_timeout: Duration) -> Duration {
    Duration::from_millis(block_ms) + response_timeout
}

/// Idle time to stamp on an abandoned entry so it becomes claimable after `delay_ms`.
fn abandon_idle_ms(claim_idle_ms: u64, delay_ms: u64) -> u64 {
    claim_idle_ms.saturating_sub(delay_ms)
}

/// Consumer group for a queue or a topic subscription.
fn group_name(entity: &str, subscription: Option<&str>) -> String {
    match subscription {
        Some(subscription) => format!("{}:{}", entity, subscription),
        None => format!("{}:consumers", entity),
    }
}

fn parse_entries(entries: StreamEntries) -> Vec<InboundMessage> {
    let mut messages = Vec::with_capacity(entries.len());

    for (stream_id, fields) in entries {
        let mut payload = None;
        let mut content_type = None;
        for (key, value) in fields {
            match key.as_str() {
                PAYLOAD_FIELD => payload = Some(value),
                CONTENT_TYPE_FIELD => content_type = Some(String::from_utf8_lossy(&value).into_owned()),
                _ => {}
            }
        }

        let payload = payload.unwrap_or_else(|| {
            warn!(stream_id = %stream_id, "Missing 'payload' field in message");
            Vec::new()
        });

        let mut message = InboundMessage::new(stream_id.clone(), payload)
            .with_enqueued_at(parse_stream_timestamp(&stream_id));
        if let Some(content_type) = content_type {
            message = message.with_content_type(content_type);
        }
        messages.push(message);
    }

    messages
}

fn is_busy_group(err: &redis::RedisError) -> bool {
    err.to_string().contains("BUSYGROUP")
}

fn is_no_group(err: &redis::RedisError) -> bool {
    err.to_string().contains("NOGROUP")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_names() {
        assert_eq!(group_name("orders", None), "orders:consumers");
        assert_eq!(group_name("events", Some("audit")), "events:audit");
    }

    #[test]
    fn test_parse_entries() {
        let entries: StreamEntries = vec![(
            "1700000000000-0".to_string(),
            vec![
                ("payload".to_string(), br#"{"Foo":"Bar"}"#.to_vec()),
                ("content_type".to_string(), b"application/json".to_vec()),
            ],
        )];

        let messages = parse_entries(entries);

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id(), "1700000000000-0");
        assert_eq!(messages[0].payload, br#"{"Foo":"Bar"}"#);
        assert_eq!(
            messages[0].metadata.content_type.as_deref(),
            Some("application/json")
        );
        assert_eq!(messages[0].metadata.enqueued_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_entry_without_payload_is_still_delivered() {
        let entries: StreamEntries = vec![(
            "1700000000000-1".to_string(),
            vec![("job".to_string(), b"{}".to_vec())],
        )];

        let messages = parse_entries(entries);

        assert_eq!(messages.len(), 1);
        assert!(messages[0].payload.is_empty());
        assert!(messages[0].metadata.content_type.is_none());
    }

    #[test]
    fn test_reader_timeout_covers_block() {
        let timeout = read_timeout(1000, Duration::from_millis(500));
        assert_eq!(timeout, Duration::from_millis(1500));
        assert!(timeout > Duration::from_millis(1000));
    }

    #[test]
    fn test_abandon_idle_backdates_by_delay() {
        assert_eq!(abandon_idle_ms(30_000, 5_000), 25_000);
        assert_eq!(abandon_idle_ms(30_000, 0), 30_000);
        assert_eq!(abandon_idle_ms(1_000, 5_000), 0);
    }

    mod fake_redis {
        use parking_lot::Mutex;
        use std::sync::Arc;
        use std::time::Duration;
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;
        use tokio::net::tcp::OwnedReadHalf;

        /// Minimal RESP2 server that records every command. `XREADGROUP`
        /// replies nil after the block window and `XPENDING` reports
        /// nothing pending; `MULTI`/`EXEC` are honoured.
        pub struct FakeRedis {
            pub url: String,
            pub commands: Arc<Mutex<Vec<Vec<String>>>>,
        }

        impl FakeRedis {
            pub async fn start(block: Duration) -> Self {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let url = format!("redis://{}", listener.local_addr().unwrap());
                let commands = Arc::new(Mutex::new(Vec::new()));

                let log = commands.clone();
                tokio::spawn(async move {
                    while let Ok((stream, _)) = listener.accept().await {
                        tokio::spawn(serve(stream, block, log.clone()));
                    }
                });

                Self { url, commands }
            }

            pub fn sent(&self, name: &str) -> Vec<Vec<String>> {
                self.commands
                    .lock()
                    .iter()
                    .filter(|c| c.first().is_some_and(|n| n.eq_ignore_ascii_case(name)))
                    .cloned()
                    .collect()
            }
        }

        async fn serve(
            stream: tokio::net::TcpStream,
            block: Duration,
            log: Arc<Mutex<Vec<Vec<String>>>>,
        ) -> std::io::Result<()> {
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut queued: Option<usize> = None;

            while let Some(command) = read_command(&mut reader).await? {
                log.lock().push(command.clone());
                let name = command.first().map(|n| n.to_ascii_uppercase()).unwrap_or_default();

                let reply = match (name.as_str(), queued) {
                    ("MULTI", _) => {
                        queued = Some(0);
                        "+OK\r\n".to_string()
                    }
                    ("EXEC", Some(n)) => {
                        queued = None;
                        format!("*{}\r\n{}", n, ":1\r\n".repeat(n))
                    }
                    (_, Some(n)) => {
                        queued = Some(n + 1);
                        "+QUEUED\r\n".to_string()
                    }
                    ("XPENDING", None) => "*0\r\n".to_string(),
                    ("XACK", None) => ":1\r\n".to_string(),
                    ("XREADGROUP", None) => {
                        tokio::time::sleep(block).await;
                        "*-1\r\n".to_string()
                    }
                    _ => "+OK\r\n".to_string(),
                };
                write.write_all(reply.as_bytes()).await?;
            }
            Ok(())
        }

        async fn read_command(
            reader: &mut BufReader<OwnedReadHalf>,
        ) -> std::io::Result<Option<Vec<String>>> {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let count: usize = line.trim_end().trim_start_matches('*').parse().unwrap_or(0);

            let mut parts = Vec::with_capacity(count);
            for _ in 0..count {
                line.clear();
                reader.read_line(&mut line).await?;
                let len: usize = line.trim_end().trim_start_matches('$').parse().unwrap_or(0);
                let mut buf = vec![0; len + 2];
                reader.read_exact(&mut buf).await?;
                buf.truncate(len);
                parts.push(String::from_utf8_lossy(&buf).into_owned());
            }
            Ok(Some(parts))
        }
    }

    use fake_redis::FakeRedis;

    fn queue(name: &str) -> SubscriptionRequest {
        SubscriptionRequest {
            name: name.into(),
            subscription: None,
            filter: None,
            take_quantity: 10,
        }
    }

    async fn broker(server: &FakeRedis) -> RedisStreamsBroker {
        let client = redis::Client::open(server.url.as_str()).unwrap();
        RedisStreamsBroker::connect(client, Duration::from_millis(500))
            .await
            .unwrap()
            .with_block_ms(1000)
            .with_claim_idle_ms(30_000)
            .with_redelivery_delay_ms(5_000)
    }

    #[tokio::test]
    async fn test_idle_blocking_read_returns_empty_batch() {
        let server = FakeRedis::start(Duration::from_millis(1000)).await;
        let broker = broker(&server).await;
        let handle = broker.open_subscription(&queue("orders")).await.unwrap();

        let started = std::time::Instant::now();
        let batch = broker.receive(&handle).await.unwrap();

        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(
            server.sent("XPENDING"),
            vec![vec!["XPENDING", "orders", "orders:consumers", "IDLE", "30000", "-", "+", "10"]]
        );
    }

    #[tokio::test]
    async fn test_blocking_read_does_not_delay_acknowledge() {
        let server = FakeRedis::start(Duration::from_millis(1000)).await;
        let broker = broker(&server).await;
        let handle = broker.open_subscription(&queue("orders")).await.unwrap();

        let reading = {
            let broker = broker.clone();
            let handle = handle.clone();
            tokio::spawn(async move { broker.receive(&handle).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        broker.acknowledge(&handle, "1-0").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        assert!(reading.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandon_backdates_idle_time() {
        let server = FakeRedis::start(Duration::from_millis(10)).await;
        let broker = broker(&server).await;
        let handle = broker.open_subscription(&queue("orders")).await.unwrap();

        broker.abandon(&handle, "1-0").await.unwrap();

        let xclaim = server.sent("XCLAIM");
        assert_eq!(xclaim.len(), 1);
        assert_eq!(xclaim[0][5..], ["1-0", "IDLE", "25000", "JUSTID"]);
    }

    #[tokio::test]
    async fn test_dead_letter_copies_then_acknowledges_atomically() {
        let server = FakeRedis::start(Duration::from_millis(10)).await;
        let broker = broker(&server).await;
        let handle = broker.open_subscription(&queue("orders")).await.unwrap();
        let message = InboundMessage::new("7-0", br#"{"id":7}"#.to_vec()).with_delivery_count(5);

        broker.dead_letter(&handle, &message, "handler failed").await.unwrap();

        let commands: Vec<String> = server
            .commands
            .lock()
            .iter()
            .filter_map(|c| c.first().cloned())
            .skip_while(|name| name != "MULTI")
            .collect();
        assert_eq!(commands, vec!["MULTI", "XADD", "XACK", "EXEC"]);

        let xadd = &server.sent("XADD")[0];
        assert_eq!(xadd[1], "orders:dlq");
        let field = |key: &str| {
            let at = xadd.iter().position(|f| f == key).unwrap();
            xadd[at + 1].clone()
        };
        assert_eq!(field("payload"), r#"{"id":7}"#);
        assert_eq!(field("original_id"), "7-0");
        assert_eq!(field("delivery_count"), "5");
        assert_eq!(field("error"), "handler failed");
        assert_eq!(server.sent("XACK")[0], vec!["XACK", "orders", "orders:consumers", "7-0"]);
    }
}

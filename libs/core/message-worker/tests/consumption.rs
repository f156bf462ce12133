//! End-to-end consumption against the in-memory broker.

use message_worker::{
    BoxError, HandlerRegistry, InMemoryBroker, InboundMessage, LoopState, MessageWorker,
    Registrar, RegistryError, RetryPolicy, RetryPolicyConfig, Worker, WorkerConfig,
    current_delivery, publish_json,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Shipment {
    id: u32,
    fail_first_attempt: bool,
}

#[derive(Default)]
struct Shipping {
    shipped: Mutex<Vec<u32>>,
    peeked: Mutex<Vec<u32>>,
    audited: Mutex<Vec<String>>,
}

impl Shipping {
    async fn on_shipment(self: Arc<Self>, shipment: Shipment) -> Result<u32, BoxError> {
        let delivery = current_delivery().ok_or("no delivery in scope")?;
        if shipment.fail_first_attempt && !(delivery.metadata().delivery_count > 1) {
            return Err("carrier unavailable".into());
        }
        self.shipped.lock().push(shipment.id);
        Ok(shipment.id)
    }

    async fn on_peek(self: Arc<Self>, shipment: Shipment) -> Result<(), BoxError> {
        self.peeked.lock().push(shipment.id);
        Ok(())
    }

    async fn on_audit(self: Arc<Self>, event: serde_json::Value) -> Result<(), BoxError> {
        let delivery = current_delivery().ok_or("no delivery in scope")?;
        self.audited.lock().push(event["kind"].as_str().unwrap_or_default().to_string());
        delivery.complete().await?;
        Ok(())
    }
}

impl Worker for Shipping {
    const BROKER_CONFIG: &'static str = "shipping";

    fn register(r: &mut Registrar<Self>) {
        r.queue("shipments", Self::on_shipment).delete_after_read();
        r.queue("peeks", Self::on_peek);
        r.topic("shipping-events", "audit", Self::on_audit);
    }
}

struct Harness {
    shipping: Arc<Shipping>,
    broker: Arc<InMemoryBroker>,
    worker: Arc<MessageWorker>,
    stop: watch::Sender<bool>,
    run: JoinHandle<Result<(), message_worker::WorkerError>>,
}

impl Harness {
    async fn start() -> Self {
        let shipping = Arc::new(Shipping::default());
        let descriptor = HandlerRegistry::discover(shipping.clone()).unwrap();
        let broker = Arc::new(InMemoryBroker::new().with_receive_timeout(Duration::from_millis(50)));
        let config = WorkerConfig::new().with_settle_retry(RetryPolicyConfig::none());
        let worker = Arc::new(MessageWorker::new(Arc::new(descriptor), broker.clone(), config).unwrap());

        let (stop, shutdown) = watch::channel(false);
        let run = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(shutdown).await }
        });
        worker
            .subscribe_state()
            .wait_for(|s| *s == LoopState::Running)
            .await
            .unwrap();

        Self {
            shipping,
            broker,
            worker,
            stop,
            run,
        }
    }

    async fn publish<T: Serialize>(&self, destination: &str, value: &T) -> String {
        publish_json(self.broker.as_ref(), &RetryPolicy::no_retry(), destination, value)
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.stop.send(true).unwrap();
        self.run.await.unwrap().unwrap();
        assert_eq!(self.worker.state(), LoopState::Stopped);
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_delete_after_read_acknowledges_handled_message() {
    let harness = Harness::start().await;

    let id = harness
        .publish("shipments", &Shipment { id: 7, fail_first_attempt: false })
        .await;

    eventually(|| harness.broker.acknowledged() == vec![id.clone()]).await;
    assert_eq!(*harness.shipping.shipped.lock(), vec![7]);
    assert_eq!(harness.broker.in_flight(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_without_delete_after_read_message_stays_in_flight() {
    let harness = Harness::start().await;

    harness
        .publish("peeks", &Shipment { id: 3, fail_first_attempt: false })
        .await;

    eventually(|| harness.shipping.peeked.lock().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.broker.acknowledged().is_empty());
    assert!(harness.broker.abandoned().is_empty());
    assert_eq!(harness.broker.in_flight(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_handler_completes_explicitly() {
    let harness = Harness::start().await;

    let id = harness
        .publish("shipping-events", &serde_json::json!({"kind": "delivered"}))
        .await;

    eventually(|| harness.broker.acknowledged() == vec![id.clone()]).await;
    assert_eq!(*harness.shipping.audited.lock(), vec!["delivered".to_string()]);

    harness.stop().await;
}

#[tokio::test]
async fn test_faulted_message_is_abandoned_and_redelivered() {
    let harness = Harness::start().await;

    let id = harness
        .publish("shipments", &Shipment { id: 9, fail_first_attempt: true })
        .await;

    eventually(|| harness.broker.acknowledged() == vec![id.clone()]).await;
    assert_eq!(harness.broker.abandoned(), vec![id.clone()]);
    assert_eq!(*harness.shipping.shipped.lock(), vec![9]);

    harness.stop().await;
}

#[tokio::test]
async fn test_undecodable_payload_is_abandoned() {
    let harness = Harness::start().await;

    harness
        .broker
        .push("peeks", InboundMessage::new("bad-1", b"{not json".to_vec()));

    eventually(|| harness.broker.abandoned().first().map(String::as_str) == Some("bad-1")).await;
    assert!(harness.shipping.peeked.lock().is_empty());

    harness.stop().await;
}

struct Slow;

impl Slow {
    async fn crawl(self: Arc<Self>) -> Result<(), BoxError> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }
}

impl Worker for Slow {
    const BROKER_CONFIG: &'static str = "slow";

    fn register(r: &mut Registrar<Self>) {
        r.queue("crawl", Self::crawl).take(3).delete_after_read();
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_rest_of_batch() {
    let broker = Arc::new(InMemoryBroker::new());
    for id in ["c-1", "c-2", "c-3"] {
        broker.push("crawl", InboundMessage::new(id, Vec::new()));
    }
    let descriptor = HandlerRegistry::discover(Arc::new(Slow)).unwrap();
    let worker = MessageWorker::new(Arc::new(descriptor), broker.clone(), WorkerConfig::new()).unwrap();

    let (stop, shutdown) = watch::channel(false);
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        stop.send(true).unwrap();
    });

    worker.run(shutdown).await.unwrap();
    stopper.await.unwrap();

    assert_eq!(broker.acknowledged(), vec!["c-1".to_string()]);
    assert_eq!(broker.abandoned(), vec!["c-2".to_string(), "c-3".to_string()]);
    assert_eq!(broker.pending("crawl"), 2);
}

#[derive(Default)]
struct Poison {
    attempts: Mutex<Vec<(u32, tokio::time::Instant)>>,
}

impl Poison {
    async fn swallow(self: Arc<Self>, _value: serde_json::Value) -> Result<(), BoxError> {
        let delivery = current_delivery().ok_or("no delivery in scope")?;
        self.attempts
            .lock()
            .push((delivery.metadata().delivery_count, tokio::time::Instant::now()));
        Err("always fails".into())
    }
}

impl Worker for Poison {
    const BROKER_CONFIG: &'static str = "poison";

    fn register(r: &mut Registrar<Self>) {
        r.queue("poison", Self::swallow).delete_after_read();
    }
}

#[tokio::test(start_paused = true)]
async fn test_poison_message_is_dead_lettered_after_max_deliveries() {
    let poison = Arc::new(Poison::default());
    let broker = Arc::new(InMemoryBroker::new().with_redelivery_delay(Duration::from_secs(2)));
    broker.push("poison", InboundMessage::new("p-1", b"{}".to_vec()));

    let descriptor = HandlerRegistry::discover(poison.clone()).unwrap();
    let config = WorkerConfig::new()
        .with_settle_retry(RetryPolicyConfig::none())
        .with_max_deliveries(3);
    let worker = MessageWorker::new(Arc::new(descriptor), broker.clone(), config).unwrap();

    let (stop, shutdown) = watch::channel(false);
    let run = tokio::spawn(async move { worker.run(shutdown).await });

    tokio::time::timeout(Duration::from_secs(30), async {
        while broker.dead_lettered().is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("message never dead-lettered");
    stop.send(true).unwrap();
    run.await.unwrap().unwrap();

    let attempts = poison.attempts.lock().clone();
    let counts: Vec<u32> = attempts.iter().map(|(count, _)| *count).collect();
    assert_eq!(counts, vec![1, 2, 3]);
    for pair in attempts.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(2));
    }

    assert_eq!(broker.dead_lettered(), vec!["p-1".to_string()]);
    assert_eq!(broker.abandoned(), vec!["p-1".to_string(); 2]);
    assert_eq!(broker.pending("poison:dlq"), 1);
    assert_eq!(broker.pending("poison"), 0);
    assert_eq!(broker.in_flight(), 0);
}

#[derive(Default)]
struct Lanes {
    fast: Mutex<Vec<u32>>,
}

impl Lanes {
    async fn stuck(self: Arc<Self>) -> Result<(), BoxError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    async fn fast(self: Arc<Self>, n: u32) -> Result<(), BoxError> {
        self.fast.lock().push(n);
        Ok(())
    }
}

impl Worker for Lanes {
    const BROKER_CONFIG: &'static str = "lanes";

    fn register(r: &mut Registrar<Self>) {
        r.queue("stuck", Self::stuck).delete_after_read();
        r.queue("fast", Self::fast).delete_after_read();
    }
}

#[tokio::test(start_paused = true)]
async fn test_stuck_handler_does_not_block_other_bindings() {
    let lanes = Arc::new(Lanes::default());
    let broker = Arc::new(InMemoryBroker::new());
    broker.push("stuck", InboundMessage::new("s-1", Vec::new()));

    let descriptor = HandlerRegistry::discover(lanes.clone()).unwrap();
    let config = WorkerConfig::new().with_shutdown_grace(Duration::from_secs(1));
    let worker = Arc::new(MessageWorker::new(Arc::new(descriptor), broker.clone(), config).unwrap());

    let (stop, shutdown) = watch::channel(false);
    let run = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(shutdown).await }
    });

    // The stuck handler is now mid-dispatch
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.in_flight(), 1);

    let policy = RetryPolicy::no_retry();
    for n in 0..3u32 {
        publish_json(broker.as_ref(), &policy, "fast", &n).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        while broker.acknowledged().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("fast binding starved by stuck handler");

    assert_eq!(*lanes.fast.lock(), vec![0, 1, 2]);
    assert!(!broker.acknowledged().contains(&"s-1".to_string()));
    assert_eq!(broker.in_flight(), 1);

    stop.send(true).unwrap();
    run.await.unwrap().unwrap();
    assert_eq!(worker.state(), LoopState::Stopped);
}

struct Clashing;

impl Clashing {
    async fn one(self: Arc<Self>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn two(self: Arc<Self>, _value: serde_json::Value) -> Result<(), BoxError> {
        Ok(())
    }
}

impl Worker for Clashing {
    const BROKER_CONFIG: &'static str = "clashing";

    fn register(r: &mut Registrar<Self>) {
        r.queue("jobs", Self::one);
        r.queue("jobs", Self::two);
    }
}

#[test]
fn test_duplicate_binding_fails_discovery() {
    let mut registry = HandlerRegistry::new();
    let err = registry.register(Arc::new(Clashing)).unwrap_err();

    match err {
        RegistryError::DuplicateBinding { key, .. } => assert_eq!(key.to_string(), "queue:jobs"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(registry.get::<Clashing>().is_none());
}

#[test]
fn test_worker_registers_once() {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(Slow)).unwrap();

    assert!(matches!(
        registry.register(Arc::new(Slow)),
        Err(RegistryError::WorkerAlreadyRegistered(_))
    ));
    assert_eq!(registry.descriptors().count(), 1);
}

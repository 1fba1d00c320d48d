//! End-to-end tests for the dispatch pipeline.
//!
//! These run entirely in-process over the in-memory queue store, so no
//! external services are required:
//!
//! ```bash
//! cargo test -p courier-dispatch --test integration
//! ```
//!
//! Each test wires a producer, the worker pool and the subscription fanout
//! together the way the daemon does, then asserts on the terminal state of
//! the store and the sinks.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use courier_common::config::DispatchConfig;
use courier_common::types::NotificationEvent;
use courier_dispatch::producer::ProducerGateway;
use courier_dispatch::worker::{StatsSnapshot, WorkerPool};
use courier_fanout::registry::SubscriptionFanout;
use courier_fanout::sink::{ChannelSink, EventSink, SinkError};
use courier_queue::memory_store::MemoryQueueStore;
use courier_queue::store::QueueStore;

// ============================================================
// Test plumbing
// ============================================================

fn test_config(worker_count: usize, queues: &[&str]) -> DispatchConfig {
    DispatchConfig {
        queue_names: queues.iter().map(|q| q.to_string()).collect(),
        worker_count,
        poll_backoff_min_ms: 1,
        poll_backoff_max_ms: 10,
        ..DispatchConfig::default()
    }
}

/// Sink that records every event it is handed.
struct RecordingSink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn recorded(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Sink that fails the first `failures` sends, then records like
/// `RecordingSink`.
struct FlakySink {
    failures_remaining: AtomicU32,
    events: Mutex<Vec<NotificationEvent>>,
}

impl FlakySink {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: AtomicU32::new(failures),
            events: Mutex::new(Vec::new()),
        })
    }

    fn recorded(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for FlakySink {
    async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        if self.failures_remaining.load(Ordering::SeqCst) > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(SinkError::Failed("socket write failed".into()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Sink that never succeeds.
struct FailingSink;

#[async_trait]
impl EventSink for FailingSink {
    async fn send(&self, _event: &NotificationEvent) -> Result<(), SinkError> {
        Err(SinkError::Failed("downstream refused the frame".into()))
    }
}

/// Sink that takes a while before recording, for catching a worker
/// mid-delivery.
struct SlowSink {
    delay: Duration,
    events: Mutex<Vec<NotificationEvent>>,
}

impl SlowSink {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            events: Mutex::new(Vec::new()),
        })
    }

    fn recorded(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for SlowSink {
    async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        tokio::time::sleep(self.delay).await;
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Poll the pool's counters until `check` passes, panicking after 5s.
async fn wait_until<F>(pool: &WorkerPool, check: F)
where
    F: Fn(StatsSnapshot) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check(pool.stats()) {
        assert!(
            Instant::now() < deadline,
            "pool never reached the expected state: {:?}",
            pool.stats()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until a queue holds nothing ready or claimed.
async fn drain(store: &MemoryQueueStore, queue: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let depth = store.depth(queue).await.unwrap();
        if depth.ready == 0 && depth.claimed == 0 {
            return;
        }
        assert!(Instant::now() < deadline, "queue {queue} did not drain");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================
// End-to-end delivery
// ============================================================

#[tokio::test]
async fn test_published_event_reaches_channel_sink() {
    let store = Arc::new(MemoryQueueStore::new());
    let fanout = Arc::new(SubscriptionFanout::new());
    let (sink, mut rx) = ChannelSink::new(8);
    fanout
        .subscribe("conn-1", "user-1", ["orders"], Arc::new(sink))
        .await;

    let config = test_config(2, &["notifications"]);
    let pool = WorkerPool::start(store.clone(), fanout, &config);
    let producer = ProducerGateway::new(store.clone(), "notifications");

    let event_id = producer
        .publish("user-1", "orders", json!({ "total": 42 }))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.id, event_id);
    assert_eq!(received.recipient_id, "user-1");
    assert_eq!(received.topic, "orders");
    assert_eq!(received.payload, json!({ "total": 42 }));
    assert_eq!(received.attempt, 0);

    drain(&store, "notifications").await;
    wait_until(&pool, |s| s.delivered == 1).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn test_event_without_subscribers_is_acked() {
    let store = Arc::new(MemoryQueueStore::new());
    let fanout = Arc::new(SubscriptionFanout::new());
    let config = test_config(1, &["notifications"]);
    let pool = WorkerPool::start(store.clone(), fanout, &config);
    let producer = ProducerGateway::new(store.clone(), "notifications");

    producer.publish("user-9", "orders", json!({})).await.unwrap();

    wait_until(&pool, |s| s.no_subscriber_acks == 1).await;
    let stats = pool.stats();
    assert_eq!(stats.claims, 1);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.requeued, 0);
    assert_eq!(stats.dead_lettered, 0);

    let depth = store.depth("notifications").await.unwrap();
    assert_eq!(depth.ready, 0);
    assert_eq!(depth.claimed, 0);
    assert_eq!(depth.dead, 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_single_worker_drains_every_queue() {
    let store = Arc::new(MemoryQueueStore::new());
    let fanout = Arc::new(SubscriptionFanout::new());
    let sink = RecordingSink::new();
    fanout
        .subscribe("conn-1", "user-1", ["updates"], sink.clone())
        .await;

    let config = test_config(1, &["alpha", "beta"]);
    let pool = WorkerPool::start(store.clone(), fanout, &config);

    let alpha = ProducerGateway::new(store.clone(), "alpha");
    let beta = ProducerGateway::new(store.clone(), "beta");
    let first = alpha.publish("user-1", "updates", json!({ "n": 1 })).await.unwrap();
    let second = beta.publish("user-1", "updates", json!({ "n": 2 })).await.unwrap();

    wait_until(&pool, |s| s.delivered == 2).await;
    drain(&store, "alpha").await;
    drain(&store, "beta").await;

    let ids: Vec<_> = sink.recorded().iter().map(|e| e.id).collect();
    assert!(ids.contains(&first));
    assert!(ids.contains(&second));
    pool.shutdown().await;
}

// ============================================================
// Retry accounting
// ============================================================

#[tokio::test]
async fn test_transient_sink_failures_retry_until_delivered() {
    let store = Arc::new(MemoryQueueStore::new());
    let fanout = Arc::new(SubscriptionFanout::new());
    let sink = FlakySink::new(2);
    fanout
        .subscribe("conn-1", "user-2", ["billing"], sink.clone())
        .await;

    let config = test_config(1, &["notifications"]);
    let pool = WorkerPool::start(store.clone(), fanout, &config);
    let producer = ProducerGateway::new(store.clone(), "notifications");
    producer.publish("user-2", "billing", json!({ "due": 10 })).await.unwrap();

    wait_until(&pool, |s| s.delivered == 1).await;
    let stats = pool.stats();
    assert_eq!(stats.claims, 3);
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.dead_lettered, 0);

    // two failed deliveries happened before this copy
    let recorded = sink.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].attempt, 2);

    let depth = store.depth("notifications").await.unwrap();
    assert_eq!(depth.dead, 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_redelivery_skips_connection_already_served() {
    let store = Arc::new(MemoryQueueStore::new());
    let fanout = Arc::new(SubscriptionFanout::new());
    let healthy = RecordingSink::new();
    let flaky = FlakySink::new(1);
    fanout
        .subscribe("conn-healthy", "user-1", ["chat"], healthy.clone())
        .await;
    fanout
        .subscribe("conn-flaky", "user-1", ["chat"], flaky.clone())
        .await;

    let config = test_config(1, &["notifications"]);
    let pool = WorkerPool::start(store.clone(), fanout, &config);
    let producer = ProducerGateway::new(store.clone(), "notifications");
    producer.publish("user-1", "chat", json!({ "msg": "hi" })).await.unwrap();

    // first pass delivers to the healthy sink and requeues for the flaky
    // one; the second pass dedups the healthy sink instead of re-sending
    wait_until(&pool, |s| s.delivered == 2).await;
    let stats = pool.stats();
    assert_eq!(stats.dedup_skipped, 1);
    assert_eq!(stats.requeued, 1);

    assert_eq!(healthy.recorded().len(), 1);
    assert_eq!(healthy.recorded()[0].attempt, 0);
    assert_eq!(flaky.recorded().len(), 1);
    assert_eq!(flaky.recorded()[0].attempt, 1);

    let depth = store.depth("notifications").await.unwrap();
    assert_eq!(depth.dead, 0);
    pool.shutdown().await;
}

// ============================================================
// Dead letters
// ============================================================

#[tokio::test]
async fn test_exhausted_retries_park_event_in_dead_letter_queue() {
    let store = Arc::new(MemoryQueueStore::new());
    let fanout = Arc::new(SubscriptionFanout::new());
    fanout
        .subscribe("conn-1", "user-3", ["alerts"], Arc::new(FailingSink))
        .await;

    let config = test_config(1, &["notifications"]);
    let pool = WorkerPool::start(store.clone(), fanout, &config);
    let producer = ProducerGateway::new(store.clone(), "notifications");
    let event_id = producer
        .publish("user-3", "alerts", json!({ "severity": "high" }))
        .await
        .unwrap();

    wait_until(&pool, |s| s.dead_lettered == 1).await;
    let stats = pool.stats();
    assert_eq!(stats.claims, 5);
    assert_eq!(stats.requeued, 4);
    assert_eq!(stats.delivered, 0);

    let dead = store.list_dead_letters("notifications", 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event_id, event_id.to_string());
    assert_eq!(dead[0].recipient_id.as_deref(), Some("user-3"));
    assert_eq!(dead[0].topic.as_deref(), Some("alerts"));
    assert_eq!(dead[0].attempt, 5);
    assert!(dead[0].last_error.contains("Delivery failed"));

    let depth = store.depth("notifications").await.unwrap();
    assert_eq!(depth.ready, 0);
    assert_eq!(depth.claimed, 0);
    assert_eq!(depth.dead, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_malformed_payload_dead_letters_without_retry() {
    let store = Arc::new(MemoryQueueStore::new());
    let fanout = Arc::new(SubscriptionFanout::new());
    let config = test_config(1, &["notifications"]);
    let pool = WorkerPool::start(store.clone(), fanout, &config);

    // bypass the producer so the stored bytes are not a valid envelope
    let entry_id = store.enqueue("notifications", b"not-an-envelope").await.unwrap();

    wait_until(&pool, |s| s.dead_lettered == 1).await;
    let stats = pool.stats();
    assert_eq!(stats.claims, 1);
    assert_eq!(stats.requeued, 0);

    let dead = store.list_dead_letters("notifications", 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event_id, entry_id);
    assert_eq!(dead[0].recipient_id, None);
    assert_eq!(dead[0].topic, None);
    assert_eq!(dead[0].attempt, 0);
    assert!(dead[0].last_error.contains("Malformed envelope"));
    pool.shutdown().await;
}

// ============================================================
// Shutdown
// ============================================================

#[tokio::test]
async fn test_shutdown_resolves_claim_in_flight() {
    let store = Arc::new(MemoryQueueStore::new());
    let fanout = Arc::new(SubscriptionFanout::new());
    let sink = SlowSink::new(Duration::from_millis(150));
    fanout
        .subscribe("conn-1", "user-1", ["orders"], sink.clone())
        .await;

    let config = test_config(1, &["notifications"]);
    let pool = WorkerPool::start(store.clone(), fanout, &config);
    let producer = ProducerGateway::new(store.clone(), "notifications");
    producer.publish("user-1", "orders", json!({})).await.unwrap();

    // stop the pool while the worker is mid-delivery; the claim must be
    // acked on the way out, not abandoned to its lease
    wait_until(&pool, |s| s.claims == 1).await;
    pool.shutdown().await;

    assert_eq!(sink.recorded().len(), 1);
    let depth = store.depth("notifications").await.unwrap();
    assert_eq!(depth.ready, 0);
    assert_eq!(depth.claimed, 0);
    assert_eq!(depth.dead, 0);
}

#[tokio::test]
async fn test_shutdown_interrupts_idle_backoff() {
    let store = Arc::new(MemoryQueueStore::new());
    let fanout = Arc::new(SubscriptionFanout::new());

    // default backoff climbs toward seconds; shutdown must not wait it out
    let config = DispatchConfig {
        worker_count: 2,
        ..DispatchConfig::default()
    };
    let pool = WorkerPool::start(store.clone(), fanout, &config);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    pool.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
}

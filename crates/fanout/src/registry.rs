//! Subscription fanout — routes events to live connections.
//!
//! One subscription per connection: a recipient id plus the topic set the
//! client asked for. `push` looks up the recipient's connections, snapshots
//! them under the read lock, then delivers lock-free so registrations never
//! wait on a slow socket. Per-connection state (dedup cursors, last activity)
//! sits behind the subscription's own mutex, which also serializes sends to
//! the same connection.
//!
//! Dedup rule: a connection never receives the same event id twice for the
//! same topic. The cursor advances only on a successful send, so a failed
//! delivery stays eligible for redelivery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use courier_common::types::NotificationEvent;

use crate::sink::{EventSink, SinkError};

/// Default per-connection send timeout (5 seconds).
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// How a push resolved for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The sink accepted the event; the dedup cursor advanced.
    Delivered,
    /// This connection already received the event for this topic.
    DedupSkipped,
    /// The connection is gone; its subscription was dropped.
    ConnectionClosed,
    /// The send did not complete; eligible for redelivery.
    Failed(String),
}

/// Per-connection result of a `push`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub connection_id: String,
    pub result: DeliveryResult,
}

/// Snapshot returned by `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub connection_id: String,
    pub recipient_id: String,
    /// Sorted for stable logging and assertions
    pub topics: Vec<String>,
    /// Whether an earlier subscription for this connection was replaced
    pub replaced: bool,
}

struct Subscription {
    recipient_id: String,
    topics: HashSet<String>,
    sink: Arc<dyn EventSink>,
    cursor: Mutex<DeliveryCursor>,
}

struct DeliveryCursor {
    /// topic → last event id successfully delivered
    last_delivered: HashMap<String, Uuid>,
    last_activity: Instant,
}

impl DeliveryCursor {
    fn new() -> Self {
        Self {
            last_delivered: HashMap::new(),
            last_activity: Instant::now(),
        }
    }
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, Arc<Subscription>>,
    /// recipient id → connection ids subscribed for it
    by_recipient: HashMap<String, HashSet<String>>,
}

/// Remove a connection from both maps. Caller holds the write lock.
fn remove_locked(registry: &mut Registry, connection_id: &str) -> Option<Arc<Subscription>> {
    let subscription = registry.connections.remove(connection_id)?;
    if let Some(connections) = registry.by_recipient.get_mut(&subscription.recipient_id) {
        connections.remove(connection_id);
        if connections.is_empty() {
            registry.by_recipient.remove(&subscription.recipient_id);
        }
    }
    Some(subscription)
}

/// In-memory registry of live subscriptions with push-side dedup.
pub struct SubscriptionFanout {
    registry: RwLock<Registry>,
    send_timeout: Duration,
}

impl SubscriptionFanout {
    pub fn new() -> Self {
        Self::with_send_timeout(DEFAULT_SEND_TIMEOUT)
    }

    /// Create a fanout whose sink sends are bounded by `send_timeout`.
    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            send_timeout,
        }
    }

    /// Register a connection for a recipient's topics.
    ///
    /// Re-subscribing an existing connection replaces its topic set and
    /// resets its dedup cursors — a replacement starts clean, like a fresh
    /// connection.
    pub async fn subscribe(
        &self,
        connection_id: impl Into<String>,
        recipient_id: impl Into<String>,
        topics: impl IntoIterator<Item = impl Into<String>>,
        sink: Arc<dyn EventSink>,
    ) -> SubscriptionInfo {
        let connection_id = connection_id.into();
        let recipient_id = recipient_id.into();
        let topics: HashSet<String> = topics.into_iter().map(Into::into).collect();

        let mut registry = self.registry.write().await;
        let replaced = remove_locked(&mut registry, &connection_id).is_some();

        let subscription = Arc::new(Subscription {
            recipient_id: recipient_id.clone(),
            topics: topics.clone(),
            sink,
            cursor: Mutex::new(DeliveryCursor::new()),
        });
        registry
            .connections
            .insert(connection_id.clone(), subscription);
        registry
            .by_recipient
            .entry(recipient_id.clone())
            .or_default()
            .insert(connection_id.clone());

        tracing::debug!(
            connection_id = %connection_id,
            recipient_id = %recipient_id,
            topics = topics.len(),
            replaced,
            "Subscription registered"
        );

        let mut topics: Vec<String> = topics.into_iter().collect();
        topics.sort();
        SubscriptionInfo {
            connection_id,
            recipient_id,
            topics,
            replaced,
        }
    }

    /// Drop a connection's subscription. Returns whether one existed.
    pub async fn unsubscribe(&self, connection_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        let removed = remove_locked(&mut registry, connection_id).is_some();
        if removed {
            tracing::debug!(connection_id = %connection_id, "Subscription removed");
        }
        removed
    }

    /// Deliver an event to every connection subscribed to its recipient and
    /// topic. Returns one outcome per matching connection; an empty vec means
    /// nobody is listening.
    pub async fn push(&self, event: &NotificationEvent) -> Vec<PushOutcome> {
        // snapshot under the read lock; sends happen outside it
        let matching: Vec<(String, Arc<Subscription>)> = {
            let registry = self.registry.read().await;
            match registry.by_recipient.get(&event.recipient_id) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| {
                        let subscription = registry.connections.get(id)?;
                        subscription
                            .topics
                            .contains(&event.topic)
                            .then(|| (id.clone(), Arc::clone(subscription)))
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut outcomes = Vec::with_capacity(matching.len());
        for (connection_id, subscription) in matching {
            let result = self.push_one(&connection_id, &subscription, event).await;

            if matches!(result, DeliveryResult::ConnectionClosed) {
                // drop the dead connection, unless it re-subscribed meanwhile
                let mut registry = self.registry.write().await;
                if registry
                    .connections
                    .get(&connection_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &subscription))
                {
                    remove_locked(&mut registry, &connection_id);
                }
            }

            outcomes.push(PushOutcome {
                connection_id,
                result,
            });
        }
        outcomes
    }

    async fn push_one(
        &self,
        connection_id: &str,
        subscription: &Subscription,
        event: &NotificationEvent,
    ) -> DeliveryResult {
        let mut cursor = subscription.cursor.lock().await;
        cursor.last_activity = Instant::now();

        if cursor.last_delivered.get(&event.topic) == Some(&event.id) {
            tracing::debug!(
                connection_id = %connection_id,
                event_id = %event.id,
                topic = %event.topic,
                "Skipping duplicate delivery"
            );
            return DeliveryResult::DedupSkipped;
        }

        match tokio::time::timeout(self.send_timeout, subscription.sink.send(event)).await {
            Ok(Ok(())) => {
                cursor.last_delivered.insert(event.topic.clone(), event.id);
                DeliveryResult::Delivered
            }
            Ok(Err(SinkError::Closed)) => DeliveryResult::ConnectionClosed,
            Ok(Err(SinkError::Failed(reason))) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    event_id = %event.id,
                    reason = %reason,
                    "Delivery failed"
                );
                DeliveryResult::Failed(reason)
            }
            Err(_) => DeliveryResult::Failed(format!(
                "send timed out after {:?}",
                self.send_timeout
            )),
        }
    }

    /// Drop subscriptions that have seen no pushes for longer than
    /// `max_idle`. Returns the evicted connection ids.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let mut registry = self.registry.write().await;

        let mut idle = Vec::new();
        for (connection_id, subscription) in &registry.connections {
            let cursor = subscription.cursor.lock().await;
            if cursor.last_activity.elapsed() > max_idle {
                idle.push(connection_id.clone());
            }
        }
        for connection_id in &idle {
            remove_locked(&mut registry, connection_id);
        }

        if !idle.is_empty() {
            tracing::info!(evicted = idle.len(), "Evicted idle subscriptions");
        }
        idle
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }
}

impl Default for SubscriptionFanout {
    fn default() -> Self {
        Self::new()
    }
}

//! Producer gateway — the application-facing entry into the dispatch core.
//!
//! `publish` validates the event, encodes it and enqueues it durably, then
//! returns the event id. It never waits for delivery: once the enqueue
//! succeeds the event's fate belongs to the worker pool. Transient store
//! errors are retried locally with backoff; only an exhausted retry budget
//! surfaces to the caller, as `PublishFailed`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use courier_common::config::DEFAULT_PUBLISH_RETRY_BUDGET;
use courier_common::error::DispatchError;
use courier_common::types::NotificationEvent;
use courier_queue::envelope;
use courier_queue::store::QueueStore;

use crate::backoff::BackoffPolicy;

/// Bounds for the producer-local retry backoff.
const RETRY_BACKOFF_MIN: Duration = Duration::from_millis(50);
const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Validated publisher over a single queue.
pub struct ProducerGateway {
    store: Arc<dyn QueueStore>,
    queue: String,
    retry_budget: u32,
    backoff: BackoffPolicy,
}

impl ProducerGateway {
    pub fn new(store: Arc<dyn QueueStore>, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
            retry_budget: DEFAULT_PUBLISH_RETRY_BUDGET,
            backoff: BackoffPolicy::new(RETRY_BACKOFF_MIN, RETRY_BACKOFF_MAX),
        }
    }

    /// Number of enqueue tries before `publish` reports failure.
    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Publish an event with a generated id. Returns once the enqueue is
    /// durable; delivery happens asynchronously.
    pub async fn publish(
        &self,
        recipient_id: &str,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, DispatchError> {
        self.publish_with_id(Uuid::new_v4(), recipient_id, topic, payload)
            .await
    }

    /// Publish under a caller-assigned event id, for producers that need
    /// stable ids across their own retries.
    pub async fn publish_with_id(
        &self,
        event_id: Uuid,
        recipient_id: &str,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, DispatchError> {
        if recipient_id.trim().is_empty() {
            return Err(DispatchError::InvalidEvent(
                "recipient_id must not be empty".into(),
            ));
        }
        if topic.trim().is_empty() {
            return Err(DispatchError::InvalidEvent("topic must not be empty".into()));
        }

        let event = NotificationEvent {
            id: event_id,
            recipient_id: recipient_id.to_string(),
            topic: topic.to_string(),
            payload,
            created_at: Utc::now(),
            attempt: 0,
        };
        let bytes =
            envelope::encode(&event).map_err(|e| DispatchError::PublishFailed(e.to_string()))?;

        let mut last_error = String::new();
        for attempt in 0..self.retry_budget {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
            }

            match self.store.enqueue(&self.queue, &bytes).await {
                Ok(entry_id) => {
                    tracing::info!(
                        event_id = %event.id,
                        recipient_id = %event.recipient_id,
                        topic = %event.topic,
                        entry_id = %entry_id,
                        "Published event"
                    );
                    return Ok(event.id);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        event_id = %event.id,
                        attempt = attempt + 1,
                        error = %e,
                        "Enqueue failed, will retry"
                    );
                    last_error = e.to_string();
                }
                Err(e) => return Err(DispatchError::PublishFailed(e.to_string())),
            }
        }

        Err(DispatchError::PublishFailed(format!(
            "enqueue failed after {} attempts: {last_error}",
            self.retry_budget
        )))
    }
}

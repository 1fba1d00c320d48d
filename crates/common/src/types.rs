use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A notification event flowing through the dispatch core.
///
/// Immutable once published; `attempt` is the only field that changes, and
/// only via queue-store metadata when an entry is redelivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    /// Logical recipient the event is addressed to (not a connection)
    pub recipient_id: String,
    /// Topic used for subscription matching and dedup
    pub topic: String,
    /// Opaque payload; the core never interprets it
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Number of completed delivery attempts that did not end in an ack
    pub attempt: u32,
}

impl NotificationEvent {
    /// Build a fresh event with a generated id and zero attempts.
    pub fn new(recipient_id: impl Into<String>, topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_id: recipient_id.into(),
            topic: topic.into(),
            payload,
            created_at: Utc::now(),
            attempt: 0,
        }
    }
}

/// An event parked after permanent failure, kept for operator inspection.
///
/// `recipient_id` and `topic` are `None` when the envelope could not be
/// decoded; `event_id` then falls back to the queue entry id so the record
/// can still be correlated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event_id: String,
    pub recipient_id: Option<String>,
    pub topic: Option<String>,
    /// Attempt count at the moment the event was parked
    pub attempt: u32,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Record a decoded event that exhausted its retries.
    pub fn for_event(event: &NotificationEvent, attempt: u32, last_error: impl Into<String>) -> Self {
        Self {
            event_id: event.id.to_string(),
            recipient_id: Some(event.recipient_id.clone()),
            topic: Some(event.topic.clone()),
            attempt,
            last_error: last_error.into(),
            dead_lettered_at: Utc::now(),
        }
    }

    /// Record an entry whose envelope never decoded.
    pub fn for_undecodable(entry_id: impl Into<String>, attempt: u32, last_error: impl Into<String>) -> Self {
        Self {
            event_id: entry_id.into(),
            recipient_id: None,
            topic: None,
            attempt,
            last_error: last_error.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

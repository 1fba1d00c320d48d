//! Transport seam for event delivery.
//!
//! The fanout never talks to a socket directly: each connection registers an
//! `EventSink`, and the transport layer (WebSocket, SSE, in-process channel)
//! decides what "send" means. A sink send must resolve promptly — the fanout
//! bounds every call with its configured send timeout and treats an overrun
//! as a failed delivery, so one slow consumer cannot stall the rest.

use async_trait::async_trait;
use tokio::sync::mpsc;

use courier_common::types::NotificationEvent;

/// Why a sink send did not deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The receiving side is gone; the subscription should be dropped.
    Closed,
    /// The send did not complete; the delivery counts as failed.
    Failed(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Closed => write!(f, "connection closed"),
            SinkError::Failed(reason) => write!(f, "send failed: {reason}"),
        }
    }
}

/// One live connection's delivery endpoint.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver a single event to the connection.
    async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError>;
}

/// Sink backed by a bounded in-process channel.
///
/// The shipped transport for embedded use and tests; a real gateway holds the
/// receiving half and writes frames to its socket.
pub struct ChannelSink {
    tx: mpsc::Sender<NotificationEvent>,
}

impl ChannelSink {
    /// Build a sink and the receiver its events arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NotificationEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        // waits for buffer space; the fanout's timeout bounds the wait
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}

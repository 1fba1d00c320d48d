//! Queue store contract — durable, at-least-once FIFO with visibility leases.
//!
//! A claimed entry is invisible to other consumers until it is acked, nacked,
//! dead-lettered, or its lease expires. Expired leases are reclaimed on the
//! next claim, with the attempt count incremented — an expired lease counts
//! as a failed delivery. Ack, nack and dead-letter only take effect while the
//! caller still holds the lease; after expiry they are no-ops, which keeps
//! two consumers from mutating the same entry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_common::error::DispatchError;
use courier_common::types::DeadLetterEntry;

/// A queue entry handed to exactly one consumer under a lease.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedEntry {
    pub entry_id: String,
    /// Envelope bytes exactly as enqueued
    pub payload: Vec<u8>,
    /// Completed delivery attempts so far (0 on first claim)
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub lease_deadline: DateTime<Utc>,
}

/// Entry counts per queue section, for operational visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDepth {
    pub ready: u64,
    pub claimed: u64,
    pub dead: u64,
}

/// Backend contract for the durable notification queue.
///
/// Implementations must guarantee that `claim` never hands the same entry to
/// two consumers while a lease is live, and that every enqueued entry remains
/// until it is acked or dead-lettered.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append envelope bytes to the tail of `queue`. Returns the entry id.
    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<String, DispatchError>;

    /// Claim the next available entry under `lease`, reclaiming expired
    /// leases first. Non-blocking: `None` means the queue is empty.
    async fn claim(
        &self,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedEntry>, DispatchError>;

    /// Permanently remove a successfully processed entry.
    ///
    /// Returns `false` if the lease had already expired (the entry will be
    /// redelivered elsewhere; at-least-once allows this).
    async fn ack(&self, queue: &str, entry_id: &str) -> Result<bool, DispatchError>;

    /// Release a claim, increment the attempt count and return the entry to
    /// the front of the queue for redelivery.
    ///
    /// Returns `false` if the lease had already expired.
    async fn nack(&self, queue: &str, entry_id: &str) -> Result<bool, DispatchError>;

    /// Move a claimed entry out of the live queue into the dead-letter list.
    ///
    /// Returns `false` if the lease had already expired.
    async fn dead_letter(
        &self,
        queue: &str,
        entry_id: &str,
        record: DeadLetterEntry,
    ) -> Result<bool, DispatchError>;

    /// Read up to `limit` dead-letter records, newest first. Read-only.
    async fn list_dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DispatchError>;

    /// Entry counts for the queue's ready, claimed and dead sections.
    async fn depth(&self, queue: &str) -> Result<QueueDepth, DispatchError>;
}

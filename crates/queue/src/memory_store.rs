//! In-memory queue store with the same semantics as the Redis store.
//!
//! Backs the test suites and embedded single-process use. Not durable: state
//! lives only as long as the process.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use courier_common::error::DispatchError;
use courier_common::types::DeadLetterEntry;

use crate::store::{ClaimedEntry, QueueDepth, QueueStore};

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<String>,
    entries: HashMap<String, Vec<u8>>,
    attempts: HashMap<String, u32>,
    enqueued: HashMap<String, DateTime<Utc>>,
    /// entry id → lease deadline
    claimed: HashMap<String, DateTime<Utc>>,
    /// newest first
    dead: VecDeque<DeadLetterEntry>,
}

impl QueueState {
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .claimed
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for entry_id in expired {
            self.claimed.remove(&entry_id);
            *self.attempts.entry(entry_id.clone()).or_insert(0) += 1;
            self.ready.push_front(entry_id);
        }
    }

    fn drop_entry(&mut self, entry_id: &str) {
        self.entries.remove(entry_id);
        self.attempts.remove(entry_id);
        self.enqueued.remove(entry_id);
    }
}

/// Non-durable queue store for tests and embedded use.
#[derive(Default)]
pub struct MemoryQueueStore {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<String, DispatchError> {
        let entry_id = Uuid::new_v4().to_string();
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        state.entries.insert(entry_id.clone(), payload.to_vec());
        state.attempts.insert(entry_id.clone(), 0);
        state.enqueued.insert(entry_id.clone(), Utc::now());
        state.ready.push_back(entry_id.clone());
        Ok(entry_id)
    }

    async fn claim(
        &self,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedEntry>, DispatchError> {
        let now = Utc::now();
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.reclaim_expired(now);

        let Some(entry_id) = state.ready.pop_front() else {
            return Ok(None);
        };

        let deadline = now + chrono::Duration::milliseconds(lease.as_millis() as i64);
        state.claimed.insert(entry_id.clone(), deadline);

        Ok(Some(ClaimedEntry {
            payload: state.entries.get(&entry_id).cloned().unwrap_or_default(),
            attempt: state.attempts.get(&entry_id).copied().unwrap_or(0),
            enqueued_at: state.enqueued.get(&entry_id).copied().unwrap_or(now),
            lease_deadline: deadline,
            entry_id,
        }))
    }

    async fn ack(&self, queue: &str, entry_id: &str) -> Result<bool, DispatchError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        if state.claimed.remove(entry_id).is_none() {
            return Ok(false);
        }
        state.drop_entry(entry_id);
        Ok(true)
    }

    async fn nack(&self, queue: &str, entry_id: &str) -> Result<bool, DispatchError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        if state.claimed.remove(entry_id).is_none() {
            return Ok(false);
        }
        *state.attempts.entry(entry_id.to_string()).or_insert(0) += 1;
        state.ready.push_front(entry_id.to_string());
        Ok(true)
    }

    async fn dead_letter(
        &self,
        queue: &str,
        entry_id: &str,
        record: DeadLetterEntry,
    ) -> Result<bool, DispatchError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        if state.claimed.remove(entry_id).is_none() {
            return Ok(false);
        }
        state.drop_entry(entry_id);
        state.dead.push_front(record);
        Ok(true)
    }

    async fn list_dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DispatchError> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|state| state.dead.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth, DispatchError> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|state| QueueDepth {
                ready: state.ready.len() as u64,
                claimed: state.claimed.len() as u64,
                dead: state.dead.len() as u64,
            })
            .unwrap_or_default())
    }
}

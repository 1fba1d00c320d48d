//! Redis-backed queue store.
//!
//! Key layout per queue (all under a configurable prefix):
//! - `{prefix}:{queue}:ready`    — LIST of entry ids awaiting claim (RPUSH/LPOP = FIFO)
//! - `{prefix}:{queue}:entries`  — HASH entry id → envelope bytes
//! - `{prefix}:{queue}:attempts` — HASH entry id → completed delivery attempts
//! - `{prefix}:{queue}:enqueued` — HASH entry id → enqueue time (unix ms)
//! - `{prefix}:{queue}:claimed`  — ZSET entry id → lease deadline (unix ms)
//! - `{prefix}:{queue}:dead`     — LIST of dead-letter records (JSON, newest first)
//!
//! Claim safety comes from small Lua scripts: the pop-and-lease step and the
//! lease-holder mutations (ack/nack/dead-letter) each run atomically on the
//! server, so two workers can never act on the same live entry. The claim
//! script also sweeps a bounded batch of expired leases back onto the ready
//! list, incrementing their attempt counts.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_common::error::DispatchError;
use courier_common::types::DeadLetterEntry;

use crate::store::{ClaimedEntry, QueueDepth, QueueStore};

/// Maximum expired leases swept back per claim call.
const RECLAIM_BATCH: usize = 16;

/// Reclaim expired leases, then pop and lease the next ready entry.
///
/// KEYS: ready, claimed, entries, attempts, enqueued
/// ARGV: now_ms, lease_deadline_ms, reclaim_batch
const CLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('HINCRBY', KEYS[4], id, 1)
    redis.call('LPUSH', KEYS[1], id)
end
local id = redis.call('LPOP', KEYS[1])
if not id then
    return nil
end
redis.call('ZADD', KEYS[2], ARGV[2], id)
local payload = redis.call('HGET', KEYS[3], id)
if not payload then
    payload = ''
end
local attempt = redis.call('HGET', KEYS[4], id)
if not attempt then
    attempt = '0'
end
local enqueued = redis.call('HGET', KEYS[5], id)
if not enqueued then
    enqueued = '0'
end
return {id, payload, attempt, enqueued}
"#;

/// Remove an entry, only while the caller still holds its lease.
///
/// KEYS: claimed, entries, attempts, enqueued
/// ARGV: entry_id
const ACK_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('HDEL', KEYS[2], ARGV[1])
    redis.call('HDEL', KEYS[3], ARGV[1])
    redis.call('HDEL', KEYS[4], ARGV[1])
    return 1
end
return 0
"#;

/// Return an entry to the front of the ready list with attempt + 1, only
/// while the caller still holds its lease.
///
/// KEYS: claimed, attempts, ready
/// ARGV: entry_id
const NACK_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('HINCRBY', KEYS[2], ARGV[1], 1)
    redis.call('LPUSH', KEYS[3], ARGV[1])
    return 1
end
return 0
"#;

/// Move an entry out of the live queue into the dead-letter list, only while
/// the caller still holds its lease.
///
/// KEYS: claimed, entries, attempts, enqueued, dead
/// ARGV: entry_id, record_json
const DEAD_LETTER_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('HDEL', KEYS[2], ARGV[1])
    redis.call('HDEL', KEYS[3], ARGV[1])
    redis.call('HDEL', KEYS[4], ARGV[1])
    redis.call('LPUSH', KEYS[5], ARGV[2])
    return 1
end
return 0
"#;

/// Durable queue store over Redis.
pub struct RedisQueueStore {
    redis: ConnectionManager,
    prefix: String,
    claim_script: Script,
    ack_script: Script,
    nack_script: Script,
    dead_letter_script: Script,
}

impl RedisQueueStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_prefix(redis, "courier")
    }

    /// Create a store whose keys live under `prefix`.
    pub fn with_prefix(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            claim_script: Script::new(CLAIM_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            nack_script: Script::new(NACK_SCRIPT),
            dead_letter_script: Script::new(DEAD_LETTER_SCRIPT),
        }
    }

    fn key(&self, queue: &str, section: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, section)
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<String, DispatchError> {
        let entry_id = Uuid::new_v4().to_string();
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.redis.clone();

        // MULTI/EXEC so the entry never becomes claimable half-written
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.key(queue, "entries"))
            .arg(&entry_id)
            .arg(payload)
            .ignore()
            .cmd("HSET")
            .arg(self.key(queue, "attempts"))
            .arg(&entry_id)
            .arg(0)
            .ignore()
            .cmd("HSET")
            .arg(self.key(queue, "enqueued"))
            .arg(&entry_id)
            .arg(now_ms)
            .ignore()
            .cmd("RPUSH")
            .arg(self.key(queue, "ready"))
            .arg(&entry_id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(queue = %queue, entry_id = %entry_id, "Enqueued entry");
        Ok(entry_id)
    }

    async fn claim(
        &self,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedEntry>, DispatchError> {
        let now = Utc::now();
        let deadline = now + chrono::Duration::milliseconds(lease.as_millis() as i64);
        let mut conn = self.redis.clone();

        let result: Option<(String, Vec<u8>, u32, i64)> = self
            .claim_script
            .key(self.key(queue, "ready"))
            .key(self.key(queue, "claimed"))
            .key(self.key(queue, "entries"))
            .key(self.key(queue, "attempts"))
            .key(self.key(queue, "enqueued"))
            .arg(now.timestamp_millis())
            .arg(deadline.timestamp_millis())
            .arg(RECLAIM_BATCH)
            .invoke_async(&mut conn)
            .await?;

        Ok(result.map(|(entry_id, payload, attempt, enqueued_ms)| ClaimedEntry {
            entry_id,
            payload,
            attempt,
            enqueued_at: DateTime::from_timestamp_millis(enqueued_ms).unwrap_or(now),
            lease_deadline: deadline,
        }))
    }

    async fn ack(&self, queue: &str, entry_id: &str) -> Result<bool, DispatchError> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .ack_script
            .key(self.key(queue, "claimed"))
            .key(self.key(queue, "entries"))
            .key(self.key(queue, "attempts"))
            .key(self.key(queue, "enqueued"))
            .arg(entry_id)
            .invoke_async(&mut conn)
            .await?;

        Ok(removed == 1)
    }

    async fn nack(&self, queue: &str, entry_id: &str) -> Result<bool, DispatchError> {
        let mut conn = self.redis.clone();
        let released: i64 = self
            .nack_script
            .key(self.key(queue, "claimed"))
            .key(self.key(queue, "attempts"))
            .key(self.key(queue, "ready"))
            .arg(entry_id)
            .invoke_async(&mut conn)
            .await?;

        Ok(released == 1)
    }

    async fn dead_letter(
        &self,
        queue: &str,
        entry_id: &str,
        record: DeadLetterEntry,
    ) -> Result<bool, DispatchError> {
        let record_json = serde_json::to_string(&record)
            .map_err(|e| DispatchError::TransientStore(format!("dead-letter encode: {e}")))?;

        let mut conn = self.redis.clone();
        let parked: i64 = self
            .dead_letter_script
            .key(self.key(queue, "claimed"))
            .key(self.key(queue, "entries"))
            .key(self.key(queue, "attempts"))
            .key(self.key(queue, "enqueued"))
            .key(self.key(queue, "dead"))
            .arg(entry_id)
            .arg(record_json)
            .invoke_async(&mut conn)
            .await?;

        if parked == 1 {
            tracing::warn!(
                queue = %queue,
                entry_id = %entry_id,
                event_id = %record.event_id,
                attempt = record.attempt,
                error = %record.last_error,
                "Dead-lettered entry"
            );
        }
        Ok(parked == 1)
    }

    async fn list_dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DispatchError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        // LPUSH on dead-letter keeps the list newest-first already
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key(queue, "dead"))
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str::<DeadLetterEntry>(&item) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(queue = %queue, error = %e, "Skipping unreadable dead-letter record")
                }
            }
        }
        Ok(records)
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth, DispatchError> {
        let mut conn = self.redis.clone();
        let (ready, claimed, dead): (u64, u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(self.key(queue, "ready"))
            .cmd("ZCARD")
            .arg(self.key(queue, "claimed"))
            .cmd("LLEN")
            .arg(self.key(queue, "dead"))
            .query_async(&mut conn)
            .await?;

        Ok(QueueDepth {
            ready,
            claimed,
            dead,
        })
    }
}

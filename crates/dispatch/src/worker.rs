//! Dispatch worker pool — claims queue entries and fans them out.
//!
//! Each worker runs the same loop over the configured queues:
//!
//! 1. Claim the next entry under the visibility lease. An empty poll backs
//!    off with jitter; a store error backs off the same way and never kills
//!    the worker.
//! 2. Decode the envelope. Undecodable bytes go straight to the dead-letter
//!    queue — retrying cannot fix them.
//! 3. Push through the subscription fanout. No live subscriber means the
//!    event is processed: ack and move on.
//! 4. Every push delivered or dedup-skipped → ack. Any failed push → requeue
//!    with attempt + 1, or dead-letter once the attempt ceiling is reached.
//!
//! Workers coordinate only through the store's claim exclusivity. Shutdown is
//! cooperative: the flag is observed between iterations, so an entry in hand
//! is always resolved before the worker exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use courier_common::config::DispatchConfig;
use courier_common::error::DispatchError;
use courier_common::types::DeadLetterEntry;
use courier_fanout::registry::{DeliveryResult, SubscriptionFanout};
use courier_queue::envelope;
use courier_queue::store::{ClaimedEntry, QueueStore};

use crate::backoff::BackoffPolicy;

/// Counters shared by all workers in a pool. Relaxed atomics: the numbers
/// feed logs and inspection, not control flow.
#[derive(Debug, Default)]
pub struct WorkerPoolStats {
    claims: AtomicU64,
    delivered: AtomicU64,
    dedup_skipped: AtomicU64,
    no_subscriber_acks: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time view of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub claims: u64,
    pub delivered: u64,
    pub dedup_skipped: u64,
    pub no_subscriber_acks: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl WorkerPoolStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            claims: self.claims.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dedup_skipped: self.dedup_skipped.load(Ordering::Relaxed),
            no_subscriber_acks: self.no_subscriber_acks.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

struct Worker {
    worker_id: usize,
    store: Arc<dyn QueueStore>,
    fanout: Arc<SubscriptionFanout>,
    queues: Vec<String>,
    lease: Duration,
    max_attempts: u32,
    idle_backoff: BackoffPolicy,
    stats: Arc<WorkerPoolStats>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(worker_id = self.worker_id, "Worker started");
        let mut idle_polls: u32 = 0;

        // stagger the starting queue so workers spread across the list
        let mut next_queue = self.worker_id;

        while !*shutdown.borrow() {
            match self.poll_once(next_queue).await {
                Ok(true) => {
                    idle_polls = 0;
                }
                Ok(false) => {
                    // nothing claimable anywhere right now
                    let delay = self.idle_backoff.delay_for_attempt(idle_polls);
                    idle_polls = idle_polls.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    let delay = self.idle_backoff.delay_for_attempt(idle_polls);
                    idle_polls = idle_polls.saturating_add(1);
                    tracing::warn!(
                        worker_id = self.worker_id,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Store error, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
            next_queue = next_queue.wrapping_add(1);
        }

        tracing::debug!(worker_id = self.worker_id, "Worker stopped");
    }

    /// Try each queue once, starting at `offset`, and process the first
    /// claimable entry. Returns whether anything was processed.
    async fn poll_once(&self, offset: usize) -> Result<bool, DispatchError> {
        for i in 0..self.queues.len() {
            let queue = &self.queues[(offset + i) % self.queues.len()];
            if let Some(entry) = self.store.claim(queue, self.lease).await? {
                self.stats.claims.fetch_add(1, Ordering::Relaxed);
                self.process(queue, entry).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resolve one claimed entry: ack, requeue or dead-letter. If a store
    /// call fails part-way the lease expiry returns the entry to the queue.
    async fn process(&self, queue: &str, entry: ClaimedEntry) -> Result<(), DispatchError> {
        let event = match envelope::decode(&entry.payload) {
            Ok(mut event) => {
                // the store's count is authoritative across redeliveries
                event.attempt = entry.attempt;
                event
            }
            Err(e) => {
                tracing::warn!(
                    worker_id = self.worker_id,
                    queue = %queue,
                    entry_id = %entry.entry_id,
                    error = %e,
                    "Malformed envelope, dead-lettering"
                );
                let record =
                    DeadLetterEntry::for_undecodable(&entry.entry_id, entry.attempt, e.to_string());
                self.store.dead_letter(queue, &entry.entry_id, record).await?;
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        let outcomes = self.fanout.push(&event).await;

        if outcomes.is_empty() {
            // nobody is listening; the event is processed, not failed
            tracing::debug!(
                worker_id = self.worker_id,
                event_id = %event.id,
                recipient_id = %event.recipient_id,
                topic = %event.topic,
                "No live subscribers, acking"
            );
            self.store.ack(queue, &entry.entry_id).await?;
            self.stats.no_subscriber_acks.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let mut last_failure: Option<String> = None;
        for outcome in &outcomes {
            match &outcome.result {
                DeliveryResult::Delivered => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                DeliveryResult::DedupSkipped => {
                    self.stats.dedup_skipped.fetch_add(1, Ordering::Relaxed);
                }
                // the subscriber vanished mid-push; nothing left to retry for
                DeliveryResult::ConnectionClosed => {}
                DeliveryResult::Failed(reason) => {
                    last_failure = Some(reason.clone());
                }
            }
        }

        match last_failure {
            None => {
                self.store.ack(queue, &entry.entry_id).await?;
                tracing::debug!(
                    worker_id = self.worker_id,
                    event_id = %event.id,
                    connections = outcomes.len(),
                    "Event dispatched"
                );
            }
            Some(reason) => {
                let failure = DispatchError::DeliveryFailed(reason);
                let next_attempt = entry.attempt + 1;

                if next_attempt >= self.max_attempts {
                    let exhausted = DispatchError::MaxAttemptsExceeded {
                        attempts: next_attempt,
                    };
                    tracing::warn!(
                        worker_id = self.worker_id,
                        event_id = %event.id,
                        error = %exhausted,
                        cause = %failure,
                        "Retries exhausted, dead-lettering"
                    );
                    let record = DeadLetterEntry::for_event(&event, next_attempt, failure.to_string());
                    self.store.dead_letter(queue, &entry.entry_id, record).await?;
                    self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                } else {
                    tracing::debug!(
                        worker_id = self.worker_id,
                        event_id = %event.id,
                        attempt = next_attempt,
                        error = %failure,
                        "Delivery failed, requeueing"
                    );
                    self.store.nack(queue, &entry.entry_id).await?;
                    self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

/// Fixed-size pool of dispatch workers over one store and fanout.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<WorkerPoolStats>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers consuming `config.queue_names`.
    pub fn start(
        store: Arc<dyn QueueStore>,
        fanout: Arc<SubscriptionFanout>,
        config: &DispatchConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(WorkerPoolStats::default());

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let worker = Worker {
                worker_id,
                store: Arc::clone(&store),
                fanout: Arc::clone(&fanout),
                queues: config.queue_names.clone(),
                lease: config.lease(),
                max_attempts: config.max_attempts,
                idle_backoff: BackoffPolicy::new(
                    Duration::from_millis(config.poll_backoff_min_ms),
                    Duration::from_millis(config.poll_backoff_max_ms),
                ),
                stats: Arc::clone(&stats),
            };
            workers.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        tracing::info!(
            workers = config.worker_count,
            queues = ?config.queue_names,
            max_attempts = config.max_attempts,
            lease_secs = config.lease_secs,
            "Dispatch pool started"
        );

        Self {
            workers,
            shutdown_tx,
            stats,
        }
    }

    /// Counters accumulated since the pool started.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Signal shutdown and wait for every worker to resolve its entry in
    /// hand and exit. No claim is left to passive lease expiry.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task failed to join");
            }
        }
        tracing::info!("Dispatch pool stopped");
    }
}

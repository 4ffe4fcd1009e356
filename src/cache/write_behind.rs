//! Write-behind queue
//!
//! L2 writes for the write-behind strategy go through a bounded queue drained
//! by one background worker. Failed writes are retried, then reported on a
//! broadcast channel; a full queue drops the write and reports it the same way.
//! `flush()` waits until every write queued before it has been attempted.
//!
//! Invalidation is ordered against the queue: each write carries an epoch, and
//! `supersede()` tombstones a key at the current epoch. The worker skips
//! writes at or below the tombstone, and deletes again if one landed while the
//! tombstone was being placed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::StoreClient;

/// Delay before retrying a failed write
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Failure notifications kept for slow subscribers
const FAILURE_CHANNEL_CAPACITY: usize = 256;

enum WriteOp {
    Set {
        key: String,
        value: Bytes,
        ttl: Duration,
        epoch: u64,
    },
    Flush(oneshot::Sender<()>),
}

/// Why a queued write did not land in L2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Queue was full; the write was never attempted
    Dropped,
    /// Every attempt failed
    Failed,
}

/// A write-behind write that did not reach L2
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBehindFailure {
    pub key: String,
    pub kind: FailureKind,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Write-behind queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteBehindStats {
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
    /// Writes skipped because the key was invalidated after queueing
    pub superseded: u64,
    pub pending: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    superseded: AtomicU64,
}

/// Per-key bookkeeping that orders invalidations against queued writes
#[derive(Debug, Default)]
struct Ledger {
    /// Last epoch handed to a queued write
    epoch: AtomicU64,
    /// Queued writes per key
    pending: DashMap<String, usize>,
    /// Writes at or below this epoch are stale
    tombstones: DashMap<String, u64>,
}

impl Ledger {
    fn admit(&self, key: &str) -> u64 {
        *self.pending.entry(key.to_string()).or_insert(0) += 1;
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn is_stale(&self, key: &str, epoch: u64) -> bool {
        self.tombstones.get(key).is_some_and(|t| *t >= epoch)
    }

    fn tombstone(&self, key: &str) -> bool {
        if !self.pending.contains_key(key) {
            return false;
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        self.tombstones
            .entry(key.to_string())
            .and_modify(|t| *t = (*t).max(epoch))
            .or_insert(epoch);
        true
    }

    /// A queued write for `key` has been handled (or was never queued)
    fn settle(&self, key: &str) {
        if let Entry::Occupied(mut entry) = self.pending.entry(key.to_string()) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
                self.tombstones.remove(key);
            }
        }
    }
}

/// Bounded queue of background L2 writes
pub struct WriteBehindQueue {
    tx: mpsc::Sender<WriteOp>,
    failures: broadcast::Sender<WriteBehindFailure>,
    counters: Arc<Counters>,
    ledger: Arc<Ledger>,
}

impl WriteBehindQueue {
    /// Spawn the worker. Must be called inside a Tokio runtime.
    pub fn spawn(store: Arc<StoreClient>, capacity: usize, retries: u32) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        let counters = Arc::new(Counters::default());
        let ledger = Arc::new(Ledger::default());

        tokio::spawn(Self::run(
            rx,
            store,
            retries,
            failures.clone(),
            Arc::clone(&counters),
            Arc::clone(&ledger),
        ));

        Self {
            tx,
            failures,
            counters,
            ledger,
        }
    }

    async fn run(
        mut rx: mpsc::Receiver<WriteOp>,
        store: Arc<StoreClient>,
        retries: u32,
        failures: broadcast::Sender<WriteBehindFailure>,
        counters: Arc<Counters>,
        ledger: Arc<Ledger>,
    ) {
        while let Some(op) = rx.recv().await {
            match op {
                WriteOp::Set {
                    key,
                    value,
                    ttl,
                    epoch,
                } => {
                    if ledger.is_stale(&key, epoch) {
                        counters.superseded.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %key, "Skipping write-behind write for invalidated key");
                        ledger.settle(&key);
                        continue;
                    }
                    let mut attempt = 0;
                    loop {
                        match store.try_set_with_ttl(&key, value.clone(), ttl).await {
                            Ok(()) if ledger.is_stale(&key, epoch) => {
                                // Invalidated while the write was in flight
                                store.del(std::slice::from_ref(&key)).await;
                                counters.superseded.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                            Ok(()) => {
                                counters.completed.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                            Err(e) if attempt < retries => {
                                attempt += 1;
                                debug!(key = %key, attempt, error = %e, "Retrying write-behind write");
                                tokio::time::sleep(RETRY_BACKOFF).await;
                            }
                            Err(e) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                warn!(key = %key, error = %e, "Write-behind write failed");
                                let _ = failures.send(WriteBehindFailure {
                                    key: key.clone(),
                                    kind: FailureKind::Failed,
                                    reason: e.to_string(),
                                    at: Utc::now(),
                                });
                                break;
                            }
                        }
                    }
                    ledger.settle(&key);
                }
                WriteOp::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        debug!("Write-behind worker stopped");
    }

    /// Queue an L2 write; returns false if the queue was full or closed
    pub fn enqueue(&self, key: &str, value: Bytes, ttl: Duration) -> bool {
        let epoch = self.ledger.admit(key);
        let op = WriteOp::Set {
            key: key.to_string(),
            value,
            ttl,
            epoch,
        };
        match self.tx.try_send(op) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "queue closed",
                };
                self.ledger.settle(key);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(key, reason, "Write-behind write dropped");
                let _ = self.failures.send(WriteBehindFailure {
                    key: key.to_string(),
                    kind: FailureKind::Dropped,
                    reason: reason.to_string(),
                    at: Utc::now(),
                });
                false
            }
        }
    }

    /// Discard every write for `key` queued so far. Call before deleting the
    /// key from L2; returns whether any write was pending.
    pub fn supersede(&self, key: &str) -> bool {
        self.ledger.tombstone(key)
    }

    /// Discard queued writes for every key `matches` accepts
    pub fn supersede_matching(&self, matches: impl Fn(&str) -> bool) -> usize {
        let keys: Vec<String> = self
            .ledger
            .pending
            .iter()
            .filter(|entry| matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.iter().filter(|key| self.ledger.tombstone(key)).count()
    }

    /// Wait until every previously queued write has been attempted
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteOp::Flush(ack))
            .await
            .map_err(|_| Error::QueueClosed)?;
        done.await.map_err(|_| Error::QueueClosed)
    }

    /// Observe writes that did not reach L2
    pub fn subscribe_failures(&self) -> broadcast::Receiver<WriteBehindFailure> {
        self.failures.subscribe()
    }

    /// Get queue statistics
    pub fn stats(&self) -> WriteBehindStats {
        let queued = self.counters.queued.load(Ordering::Relaxed);
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let superseded = self.counters.superseded.load(Ordering::Relaxed);
        WriteBehindStats {
            queued,
            completed,
            failed,
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            superseded,
            pending: queued.saturating_sub(completed + failed + superseded),
        }
    }
}

impl std::fmt::Debug for WriteBehindQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBehindQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn setup(capacity: usize) -> (WriteBehindQueue, Arc<StoreClient>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let client = Arc::new(StoreClient::new(store.clone(), Duration::from_millis(100)));
        let queue = WriteBehindQueue::spawn(client.clone(), capacity, 1);
        (queue, client, store)
    }

    #[tokio::test]
    async fn test_flush_waits_for_writes() {
        let (queue, client, _store) = setup(16);

        for i in 0..5 {
            assert!(queue.enqueue(&format!("k{}", i), Bytes::from_static(b"1"), Duration::from_secs(60)));
        }
        queue.flush().await.unwrap();

        for i in 0..5 {
            assert!(client.exists(&format!("k{}", i)).await);
        }
        let stats = queue.stats();
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_failures_are_broadcast() {
        let (queue, _client, store) = setup(16);
        let mut failures = queue.subscribe_failures();

        store.set_available(false);
        queue.enqueue("lesson:1", Bytes::from_static(b"1"), Duration::from_secs(60));
        queue.flush().await.unwrap();

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.key, "lesson:1");
        assert_eq!(failure.kind, FailureKind::Failed);
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_superseded_writes_are_skipped() {
        let (queue, client, _store) = setup(16);

        // The worker cannot run before the flush awaits
        queue.enqueue("other", Bytes::from_static(b"0"), Duration::from_secs(60));
        queue.enqueue("lesson:1", Bytes::from_static(b"1"), Duration::from_secs(60));
        queue.enqueue("lesson:2", Bytes::from_static(b"2"), Duration::from_secs(60));

        assert!(queue.supersede("lesson:1"));
        assert_eq!(queue.supersede_matching(|k| k.starts_with("lesson:")), 1);
        assert!(!queue.supersede("never-queued"));
        queue.flush().await.unwrap();

        assert!(client.exists("other").await);
        assert!(!client.exists("lesson:1").await);
        assert!(!client.exists("lesson:2").await);
        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.superseded, 2);
        assert_eq!(stats.pending, 0);

        // A write queued after the invalidation lands normally
        queue.enqueue("lesson:1", Bytes::from_static(b"3"), Duration::from_secs(60));
        queue.flush().await.unwrap();
        assert!(client.exists("lesson:1").await);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let (queue, _client, store) = setup(1);
        let mut failures = queue.subscribe_failures();

        // Stall the worker so the queue fills up
        store.set_latency(Some(Duration::from_millis(50)));

        let mut accepted = 0;
        for i in 0..10 {
            if queue.enqueue(&format!("k{}", i), Bytes::new(), Duration::from_secs(60)) {
                accepted += 1;
            }
        }
        assert!(accepted < 10);

        let stats = queue.stats();
        assert_eq!(stats.dropped, 10 - accepted);

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.kind, FailureKind::Dropped);
    }
}

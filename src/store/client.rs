//! Guarded store client
//!
//! Wraps a [`SharedStore`] so every call carries a bounded timeout. The
//! `try_*` methods surface the error; the plain methods log at `warn` and
//! degrade to a miss or no-op, so a store outage costs hit rate, never a
//! failed request.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use super::{InMemoryStore, SharedStore, StoreStats};
use crate::error::{Error, Result};

/// Transport health counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreHealth {
    /// Calls that failed with a transport error
    pub failures: u64,
    /// Calls that exceeded the timeout
    pub timeouts: u64,
}

/// Timeout-guarded client over a shared store
pub struct StoreClient {
    store: Arc<dyn SharedStore>,
    timeout: Duration,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

impl StoreClient {
    /// Create a client with the given per-call timeout
    pub fn new(store: Arc<dyn SharedStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Create with an in-memory store (for testing)
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()), Duration::from_millis(250))
    }

    /// Per-call timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// Transport health counters
    pub fn health(&self) -> StoreHealth {
        StoreHealth {
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Underlying store statistics
    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    async fn guard<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_transport() {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(Error::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
        }
    }

    fn degrade(operation: &'static str, key: &str, error: &Error) {
        warn!(operation, key, error = %error, "Shared store call failed, degrading");
    }

    // =========================================================================
    // Fallible calls
    // =========================================================================

    /// Get a value
    pub async fn try_get(&self, key: &str) -> Result<Option<Bytes>> {
        self.guard("get", self.store.get(key)).await
    }

    /// Set a value with expiry
    pub async fn try_set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.guard("set", self.store.set_with_ttl(key, value, ttl))
            .await
    }

    /// Delete keys
    pub async fn try_del(&self, keys: &[String]) -> Result<u64> {
        self.guard("del", self.store.del(keys)).await
    }

    /// Check if a key exists
    pub async fn try_exists(&self, key: &str) -> Result<bool> {
        self.guard("exists", self.store.exists(key)).await
    }

    /// List keys matching a glob
    pub async fn try_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.guard("keys", self.store.keys(pattern)).await
    }

    // =========================================================================
    // Degrading calls
    // =========================================================================

    /// Get a value; failures read as a miss
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.try_get(key).await.unwrap_or_else(|e| {
            Self::degrade("get", key, &e);
            None
        })
    }

    /// Set a value with expiry; returns false on failure
    pub async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> bool {
        match self.try_set_with_ttl(key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                Self::degrade("set", key, &e);
                false
            }
        }
    }

    /// Set a value without expiry; returns false on failure
    pub async fn set(&self, key: &str, value: Bytes) -> bool {
        match self.guard("set", self.store.set(key, value)).await {
            Ok(()) => true,
            Err(e) => {
                Self::degrade("set", key, &e);
                false
            }
        }
    }

    /// Delete keys; failures delete nothing
    pub async fn del(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        self.try_del(keys).await.unwrap_or_else(|e| {
            Self::degrade("del", &keys.join(","), &e);
            0
        })
    }

    /// Check existence; failures read as absent
    pub async fn exists(&self, key: &str) -> bool {
        self.try_exists(key).await.unwrap_or_else(|e| {
            Self::degrade("exists", key, &e);
            false
        })
    }

    /// List keys matching a glob; failures list nothing
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        self.try_keys(pattern).await.unwrap_or_else(|e| {
            Self::degrade("keys", pattern, &e);
            Vec::new()
        })
    }

    /// Prepend to a list; returns the new length, or None on failure
    pub async fn push(&self, key: &str, value: Bytes) -> Option<u64> {
        match self.guard("push", self.store.push(key, value)).await {
            Ok(len) => Some(len),
            Err(e) => {
                Self::degrade("push", key, &e);
                None
            }
        }
    }

    /// Read a list range; failures read as empty
    pub async fn range(&self, key: &str, start: isize, stop: isize) -> Vec<Bytes> {
        self.guard("range", self.store.range(key, start, stop))
            .await
            .unwrap_or_else(|e| {
                Self::degrade("range", key, &e);
                Vec::new()
            })
    }

    /// Trim a list; returns false on failure
    pub async fn trim(&self, key: &str, start: isize, stop: isize) -> bool {
        match self.guard("trim", self.store.trim(key, start, stop)).await {
            Ok(()) => true,
            Err(e) => {
                Self::degrade("trim", key, &e);
                false
            }
        }
    }

    /// Set expiry; returns false on failure or missing key
    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        self.guard("expire", self.store.expire(key, ttl))
            .await
            .unwrap_or_else(|e| {
                Self::degrade("expire", key, &e);
                false
            })
    }

    /// Push onto a capped, expiring list (ring buffer)
    pub async fn push_capped(&self, key: &str, value: Bytes, cap: usize, ttl: Duration) -> bool {
        if self.push(key, value).await.is_none() {
            return false;
        }
        let trimmed = self.trim(key, 0, cap.saturating_sub(1) as isize).await;
        let expired = self.expire(key, ttl).await;
        trimmed && expired
    }
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("timeout", &self.timeout)
            .field("health", &self.health())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn client_with_store() -> (StoreClient, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let client = StoreClient::new(store.clone(), Duration::from_millis(100));
        (client, store)
    }

    #[tokio::test]
    async fn test_outage_degrades_to_miss() {
        let (client, store) = client_with_store();
        assert!(
            client
                .set_with_ttl("k", Bytes::from_static(b"v"), Duration::from_secs(60))
                .await
        );

        store.set_available(false);
        assert_eq!(client.get("k").await, None);
        assert!(!client.exists("k").await);
        assert_eq!(client.del(&["k".to_string()]).await, 0);
        assert!(client.keys("*").await.is_empty());
        assert_eq!(client.health().failures, 4);

        store.set_available(true);
        assert_eq!(client.get("k").await, Some(Bytes::from_static(b"v")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let (client, store) = client_with_store();
        store.set_latency(Some(Duration::from_secs(1)));

        let err = client.try_get("k").await.unwrap_err();
        assert_matches!(err, Error::Timeout { operation: "get", .. });

        assert_eq!(client.get("k").await, None);
        assert_eq!(client.health().timeouts, 2);
    }

    #[tokio::test]
    async fn test_push_capped() {
        let (client, _store) = client_with_store();

        for i in 0..20u8 {
            assert!(
                client
                    .push_capped("ring", Bytes::from(vec![i]), 5, Duration::from_secs(60))
                    .await
            );
        }

        let items = client.range("ring", 0, -1).await;
        assert_eq!(items.len(), 5);
        assert_eq!(items[0], Bytes::from(vec![19u8]));
    }

    #[tokio::test]
    async fn test_del_empty_is_noop() {
        let (client, store) = client_with_store();
        assert_eq!(client.del(&[]).await, 0);
        assert_eq!(store.stats().deletes, 0);
    }
}

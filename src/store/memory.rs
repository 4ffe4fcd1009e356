//! In-memory shared store
//!
//! Single-process implementation of [`SharedStore`] with lazy TTL expiry.
//! Also used to simulate outages (`set_available(false)`) and slow backends
//! (`set_latency`) in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use super::pattern::KeyPattern;
use super::{resolve_range, SharedStore, StoreStats};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum StoredValue {
    Blob(Bytes),
    List(VecDeque<Bytes>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory [`SharedStore`] backed by DashMap
pub struct InMemoryStore {
    entries: DashMap<String, StoredEntry>,
    available: AtomicBool,
    latency: RwLock<Option<Duration>>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            latency: RwLock::new(None),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going down (false) or coming back (true)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Add artificial latency to every call
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Drop every expired key
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Check if the store holds no live keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn precheck(&self) -> Result<()> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::Relaxed) {
            return Err(Error::Transport("store unavailable".into()));
        }
        Ok(())
    }

    /// Fetch a live entry, evicting it if expired
    fn live(&self, key: &str) -> Option<StoredEntry> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.clone());
            }
        } else {
            return None;
        }
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        None
    }

    fn wrong_type(key: &str) -> Error {
        Error::Transport(format!(
            "WRONGTYPE operation against key '{}' holding the wrong kind of value",
            key
        ))
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.precheck().await?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        match self.live(key) {
            Some(StoredEntry {
                value: StoredValue::Blob(data),
                ..
            }) => Ok(Some(data)),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.precheck().await?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: StoredValue::Blob(value),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.precheck().await?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: StoredValue::Blob(value),
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.precheck().await?;
        self.deletes.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key) {
                if !entry.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.precheck().await?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.live(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.precheck().await?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let pattern = KeyPattern::new(pattern)?;
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.is_expired(now) && pattern.matches(e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn push(&self, key: &str, value: Bytes) -> Result<u64> {
        self.precheck().await?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry {
                value: StoredValue::List(VecDeque::new()),
                expires_at: None,
            });

        if entry.is_expired(now) {
            *entry = StoredEntry {
                value: StoredValue::List(VecDeque::new()),
                expires_at: None,
            };
        }

        match &mut entry.value {
            StoredValue::List(list) => {
                list.push_front(value);
                Ok(list.len() as u64)
            }
            StoredValue::Blob(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Bytes>> {
        self.precheck().await?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        match self.live(key) {
            Some(StoredEntry {
                value: StoredValue::List(list),
                ..
            }) => Ok(match resolve_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn trim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        self.precheck().await?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(());
        };

        match &mut entry.value {
            StoredValue::List(list) => {
                match resolve_range(list.len(), start, stop) {
                    Some((from, to)) => {
                        list.truncate(to + 1);
                        list.drain(..from);
                    }
                    None => list.clear(),
                }
                Ok(())
            }
            StoredValue::Blob(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.precheck().await?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = now.checked_add(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            key_count: self.len() as u64,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let store = InMemoryStore::new();

        store.set("lesson:1", b("math")).await.unwrap();
        assert_eq!(store.get("lesson:1").await.unwrap(), Some(b("math")));
        assert!(store.exists("lesson:1").await.unwrap());

        let removed = store
            .del(&["lesson:1".to_string(), "lesson:2".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!store.exists("lesson:1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .set_with_ttl("session:9", b("x"), Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.exists("session:9").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists("session:9").await.unwrap());
        assert_eq!(store.get("session:9").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_by_pattern() {
        let store = InMemoryStore::new();
        store.set("lesson:1", b("a")).await.unwrap();
        store.set("lesson:2", b("b")).await.unwrap();
        store.set("student:1", b("c")).await.unwrap();

        let mut keys = store.keys("lesson:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["lesson:1", "lesson:2"]);
    }

    #[tokio::test]
    async fn test_list_ring_buffer() {
        let store = InMemoryStore::new();

        for i in 0..150 {
            store.push("ring", b(&i.to_string())).await.unwrap();
            store.trim("ring", 0, 99).await.unwrap();
        }

        let items = store.range("ring", 0, -1).await.unwrap();
        assert_eq!(items.len(), 100);
        // Newest first
        assert_eq!(items[0], b("149"));
        assert_eq!(items[99], b("50"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_on_list() {
        let store = InMemoryStore::new();
        store.push("alerts", b("a")).await.unwrap();
        assert!(store.expire("alerts", Duration::from_secs(10)).await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.range("alerts", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = InMemoryStore::new();
        store.set("blob", b("x")).await.unwrap();
        assert!(store.push("blob", b("y")).await.is_err());

        store.push("list", b("y")).await.unwrap();
        assert!(store.get("list").await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = InMemoryStore::new();
        store.set_available(false);

        let err = store.get("k").await.unwrap_err();
        assert!(err.is_transport());

        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = InMemoryStore::new();
        store.set("a", b("1")).await.unwrap();
        store.get("a").await.unwrap();
        store.del(&["a".to_string()]).await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.key_count, 0);
    }
}

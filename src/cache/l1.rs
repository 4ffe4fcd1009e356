//! L1 Cache - Process-local Hot Tier
//!
//! Bounded in-process map of serialized entries. Reads are lock-free through
//! DashMap shards; expiry is checked on every read.
//!
//! # Design
//!
//! - Entry-count capacity with high/low watermarks
//! - Batch eviction by idle time over hit frequency
//! - Expired entries are removed lazily on read and by `purge_expired`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::entry::CacheEntry;
use super::DEFAULT_L1_MAX_ENTRIES;
use crate::store::KeyPattern;

/// L1 Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L1Config {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Fill ratio that triggers eviction
    pub high_watermark: f64,
    /// Fill ratio eviction stops at
    pub low_watermark: f64,
    /// Maximum entries evicted per pass
    pub eviction_batch_size: usize,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_L1_MAX_ENTRIES,
            high_watermark: 0.95,
            low_watermark: 0.85,
            eviction_batch_size: 1000,
        }
    }
}

/// L1 Cache - in-process hot tier
pub struct L1Cache {
    storage: DashMap<String, Arc<CacheEntry>>,
    config: L1Config,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl L1Cache {
    /// Create a new L1 cache with default configuration
    pub fn new() -> Self {
        Self::with_config(L1Config::default())
    }

    /// Create a new L1 cache with custom configuration
    pub fn with_config(config: L1Config) -> Self {
        Self {
            storage: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a live entry, dropping it if expired
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.storage.get(key).map(|e| Arc::clone(e.value()));

        match entry {
            Some(e) if e.is_expired() => {
                self.storage.remove_if(key, |_, v| v.is_expired());
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(e) => {
                e.record_hit();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(e)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace an entry
    pub fn put(&self, entry: CacheEntry) -> Option<Arc<CacheEntry>> {
        if !self.storage.contains_key(entry.key()) && self.should_evict() {
            self.evict();
        }
        self.storage.insert(entry.key().to_string(), Arc::new(entry))
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.storage.remove(key).map(|(_, e)| e)
    }

    /// Check for a live entry without counting a hit
    pub fn contains(&self, key: &str) -> bool {
        self.storage
            .get(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    /// Remove every entry whose key matches `pattern`, returning the keys
    pub fn remove_matching(&self, pattern: &KeyPattern) -> Vec<String> {
        let keys: Vec<String> = self
            .storage
            .iter()
            .filter(|e| pattern.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();

        keys.into_iter()
            .filter(|k| self.storage.remove(k).is_some())
            .collect()
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) -> usize {
        let before = self.storage.len();
        self.storage.retain(|_, e| !e.is_expired());
        before.saturating_sub(self.storage.len())
    }

    /// Evict the most evictable `fraction` of entries (used under memory pressure)
    pub fn shrink(&self, fraction: f64) -> usize {
        let target = (self.storage.len() as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize;
        self.evict_n(target)
    }

    fn should_evict(&self) -> bool {
        self.fill_ratio() >= self.config.high_watermark
    }

    fn fill_ratio(&self) -> f64 {
        if self.config.max_entries == 0 {
            return 1.0;
        }
        self.storage.len() as f64 / self.config.max_entries as f64
    }

    /// Evict down to the low watermark
    fn evict(&self) {
        let low = (self.config.max_entries as f64 * self.config.low_watermark).floor() as usize;
        let excess = self.storage.len().saturating_sub(low).max(1);
        self.evict_n(excess.min(self.config.eviction_batch_size.max(1)));
    }

    fn evict_n(&self, count: usize) -> usize {
        if count == 0 {
            return 0;
        }

        let mut candidates: Vec<(String, f64)> = self
            .storage
            .iter()
            .map(|e| (e.key().clone(), e.eviction_score()))
            .collect();

        // Highest score first = most evictable
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut evicted = 0;
        for (key, _) in candidates.into_iter().take(count) {
            if self.storage.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Get number of entries (including not yet purged expired ones)
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Get capacity
    pub fn capacity(&self) -> usize {
        self.config.max_entries
    }

    /// Total serialized bytes held
    pub fn size_bytes(&self) -> u64 {
        self.storage.iter().map(|e| e.size() as u64).sum()
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Clear the cache
    pub fn clear(&self) {
        self.storage.clear();
    }

    /// Reset hit/miss/eviction counters
    pub fn reset_counters(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// Get cache statistics
    pub fn stats(&self) -> L1Stats {
        L1Stats {
            entries: self.len(),
            capacity: self.capacity(),
            size_bytes: self.size_bytes(),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            evictions: self.evictions(),
        }
    }
}

impl Default for L1Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// L1 cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct L1Stats {
    /// Number of entries
    pub entries: usize,
    /// Entry capacity
    pub capacity: usize,
    /// Serialized bytes held
    pub size_bytes: u64,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    /// Eviction count
    pub evictions: u64,
}

// =============================================================================
// Tests
// =============================================================================

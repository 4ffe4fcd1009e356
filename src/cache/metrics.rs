//! Cache Metrics Collection
//!
//! Request, hit and latency counters for the cache engine, plus per-key hit
//! counts for top-key reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::write_behind::WriteBehindStats;

/// Default bound on the number of distinct keys tracked for top-key reporting
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

/// Which tier served a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    L1,
    L2,
}

/// Cache metrics collector
#[derive(Debug)]
pub struct CacheMetrics {
    total_requests: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,

    // Lookup latency (microseconds, exponential moving average)
    lookup_latency_us: AtomicU64,

    key_hits: DashMap<String, AtomicU64>,
    max_tracked_keys: usize,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::with_key_limit(DEFAULT_MAX_TRACKED_KEYS)
    }
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collector tracking at most `max_tracked_keys` distinct keys
    pub fn with_key_limit(max_tracked_keys: usize) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            l1_hits: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            lookup_latency_us: AtomicU64::new(0),
            key_hits: DashMap::new(),
            max_tracked_keys,
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self, key: &str, source: HitSource) {
        match source {
            HitSource::L1 => self.l1_hits.fetch_add(1, Ordering::Relaxed),
            HitSource::L2 => self.l2_hits.fetch_add(1, Ordering::Relaxed),
        };

        if let Some(counter) = self.key_hits.get(key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.key_hits.len() < self.max_tracked_keys {
            self.key_hits
                .entry(key.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = self.lookup_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .lookup_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn l1_hits(&self) -> u64 {
        self.l1_hits.load(Ordering::Relaxed)
    }

    pub fn l2_hits(&self) -> u64 {
        self.l2_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn lookup_latency(&self) -> Duration {
        Duration::from_micros(self.lookup_latency_us.load(Ordering::Relaxed))
    }

    /// Hits from either tier over total requests (0 with no traffic)
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_requests() as f64;
        if total == 0.0 {
            0.0
        } else {
            (self.l1_hits() + self.l2_hits()) as f64 / total
        }
    }

    /// Most-hit keys, highest first
    pub fn top_keys(&self, n: usize) -> Vec<KeyHits> {
        let mut keys: Vec<KeyHits> = self
            .key_hits
            .iter()
            .map(|e| KeyHits {
                key: e.key().clone(),
                hits: e.value().load(Ordering::Relaxed),
            })
            .collect();
        keys.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.key.cmp(&b.key)));
        keys.truncate(n);
        keys
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.l1_hits.store(0, Ordering::Relaxed);
        self.l2_hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.lookup_latency_us.store(0, Ordering::Relaxed);
        self.key_hits.clear();
    }
}

/// Hit count for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHits {
    pub key: String,
    pub hits: u64,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_requests: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub errors: u64,
    /// (l1Hits + l2Hits) / totalRequests
    pub hit_rate: f64,
    pub l1_entries: usize,
    pub l1_evictions: u64,
    pub l2_keys: u64,
    /// Shared store calls that failed or timed out
    pub l2_failures: u64,
    pub l2_timeouts: u64,
    /// Mean lookup latency in microseconds (EMA)
    pub avg_lookup_latency_us: u64,
    pub top_keys: Vec<KeyHits>,
    pub write_behind: WriteBehindStats,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_rate(), 0.0);

        for _ in 0..4 {
            metrics.record_request();
        }
        metrics.record_hit("a", HitSource::L1);
        metrics.record_hit("a", HitSource::L2);
        metrics.record_hit("b", HitSource::L1);
        metrics.record_miss();

        assert_eq!(metrics.l1_hits(), 2);
        assert_eq!(metrics.l2_hits(), 1);
        assert_eq!(metrics.misses(), 1);
        assert!((metrics.hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_top_keys_ordering() {
        let metrics = CacheMetrics::new();
        for _ in 0..3 {
            metrics.record_hit("hot", HitSource::L1);
        }
        metrics.record_hit("warm", HitSource::L2);

        let top = metrics.top_keys(1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].key, "hot");
        assert_eq!(top[0].hits, 3);
    }

    #[test]
    fn test_key_tracking_is_bounded() {
        let metrics = CacheMetrics::with_key_limit(2);
        metrics.record_hit("a", HitSource::L1);
        metrics.record_hit("b", HitSource::L1);
        metrics.record_hit("c", HitSource::L1);
        metrics.record_hit("a", HitSource::L1);

        let top = metrics.top_keys(10);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].key, "a");
        assert_eq!(metrics.l1_hits(), 4);
    }

    #[test]
    fn test_latency_ema() {
        let metrics = CacheMetrics::new();
        metrics.record_lookup_latency(Duration::from_micros(100));
        assert_eq!(metrics.lookup_latency(), Duration::from_micros(100));

        metrics.record_lookup_latency(Duration::from_micros(200));
        assert_eq!(metrics.lookup_latency(), Duration::from_micros(110));
    }

    #[test]
    fn test_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_request();
        metrics.record_error();
        metrics.record_hit("k", HitSource::L1);
        metrics.reset();

        assert_eq!(metrics.total_requests(), 0);
        assert_eq!(metrics.errors(), 0);
        assert!(metrics.top_keys(5).is_empty());
    }
}

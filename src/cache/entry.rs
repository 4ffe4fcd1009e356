//! Cache Entry Types
//!
//! An L1 entry holds the serialized value, its absolute expiry, tags and the
//! access statistics used for eviction and top-key reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

/// Shortest TTL accepted; expiry must lie in the future at insertion
pub const MIN_TTL: Duration = Duration::from_secs(1);

/// Longest TTL honoured (one year); longer requests are capped
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Bound a caller TTL to `[MIN_TTL, MAX_TTL]`
#[inline]
pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.clamp(MIN_TTL, MAX_TTL)
}

/// Absolute expiry `ttl` after `now`, saturating at `now + MAX_TTL`
pub fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    let far = now.checked_add(MAX_TTL).unwrap_or(now);
    now.checked_add(clamp_ttl(ttl)).unwrap_or(far)
}

/// Cache entry stored in L1
#[derive(Debug)]
pub struct CacheEntry {
    /// Key this entry is stored under
    key: String,
    /// Serialized value (zero-copy clone)
    data: Bytes,
    /// Insertion time
    created_at: Instant,
    /// Absolute expiry
    expires_at: Instant,
    /// Tags the entry was written with
    tags: Vec<String>,
    /// Number of reads served from this entry
    hit_count: AtomicU64,
    /// Last access, as milliseconds since `created_at`
    last_access_ms: AtomicU64,
}

impl CacheEntry {
    /// Create an entry that expires `ttl` from now
    pub fn new(key: impl Into<String>, data: Bytes, ttl: Duration) -> Self {
        Self::with_tags(key, data, ttl, Vec::new())
    }

    /// Create a tagged entry
    pub fn with_tags(key: impl Into<String>, data: Bytes, ttl: Duration, tags: Vec<String>) -> Self {
        let now = Instant::now();
        Self {
            key: key.into(),
            data,
            created_at: now,
            expires_at: expiry_after(now, ttl),
            tags,
            hit_count: AtomicU64::new(0),
            last_access_ms: AtomicU64::new(0),
        }
    }

    /// Entry key
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serialized value
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Serialized size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Tags attached at write time
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Absolute expiry
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Remaining lifetime (zero once expired)
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Check if the entry has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Record a read and return the new hit count
    #[inline]
    pub fn record_hit(&self) -> u64 {
        let since = self.created_at.elapsed().as_millis() as u64;
        self.last_access_ms.store(since, Ordering::Relaxed);
        self.hit_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reads served so far
    #[inline]
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Eviction score (higher = more evictable).
    ///
    /// Idle time divided by hit frequency, so cold and rarely read entries
    /// go first. Expired entries always score highest.
    pub fn eviction_score(&self) -> f64 {
        if self.is_expired() {
            return f64::MAX;
        }
        let now_ms = self.created_at.elapsed().as_millis() as u64;
        let idle = now_ms.saturating_sub(self.last_access_ms.load(Ordering::Relaxed)) as f64;
        idle / (self.hit_count() as f64 + 1.0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expiry() {
        let entry = CacheEntry::new("lesson:1", Bytes::from_static(b"{}"), Duration::from_secs(10));
        assert!(!entry.is_expired());
        assert_eq!(entry.remaining_ttl(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(entry.is_expired());
        assert_eq!(entry.remaining_ttl(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_is_clamped() {
        let entry = CacheEntry::new("k", Bytes::new(), Duration::ZERO);
        assert!(!entry.is_expired());
        assert!(entry.expires_at() > Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_tracking() {
        let entry = CacheEntry::new("k", Bytes::from_static(b"1"), Duration::from_secs(60));
        assert_eq!(entry.hit_count(), 0);
        assert_eq!(entry.record_hit(), 1);
        assert_eq!(entry.record_hit(), 2);
        assert_eq!(entry.hit_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_score_prefers_cold_entries() {
        let hot = CacheEntry::new("hot", Bytes::new(), Duration::from_secs(600));
        let cold = CacheEntry::new("cold", Bytes::new(), Duration::from_secs(600));

        tokio::time::advance(Duration::from_secs(30)).await;
        for _ in 0..10 {
            hot.record_hit();
        }

        assert!(cold.eviction_score() > hot.eviction_score());
    }

    #[test]
    fn test_tags() {
        let entry = CacheEntry::with_tags(
            "lesson:1",
            Bytes::new(),
            Duration::from_secs(5),
            vec!["planner:3".into()],
        );
        assert_eq!(entry.tags(), ["planner:3".to_string()]);
        assert_eq!(entry.key(), "lesson:1");
        assert_eq!(entry.size(), 0);
    }
}

//! Cache Engine - L1 + L2 orchestration
//!
//! Reads go L1 → L2 → loader; writes follow the configured [`WriteStrategy`].
//! Every L2 failure degrades to a miss, so the engine never fails a request
//! because the shared store is down.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::entry::{clamp_ttl, expiry_after, CacheEntry, MAX_TTL};
use super::l1::{L1Cache, L1Config};
use super::metrics::{CacheMetrics, CacheStats, HitSource, DEFAULT_MAX_TRACKED_KEYS};
use super::strategy::{LoadOptions, Tier, WriteStrategy};
use super::write_behind::{WriteBehindFailure, WriteBehindQueue};
use super::{DEFAULT_L1_TTL, DEFAULT_L2_TTL, DEFAULT_WRITE_BEHIND_CAPACITY};
use crate::config::duration_secs;
use crate::error::{Error, Result};
use crate::memory::{CleanupTaskId, MemoryController};
use crate::store::codec;
use crate::store::{tag_key, KeyPattern, StoreClient};

/// Cache engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// L1 configuration
    pub l1: L1Config,
    /// L1 TTL used when no per-call TTL is given
    #[serde(with = "duration_secs")]
    pub default_l1_ttl: Duration,
    /// L2 TTL used when no per-call TTL is given
    #[serde(with = "duration_secs")]
    pub default_l2_ttl: Duration,
    /// Strategy used when no per-call strategy is given
    pub default_strategy: WriteStrategy,
    /// Write-behind queue depth
    pub write_behind_capacity: usize,
    /// Retries per write-behind write
    pub write_behind_retries: u32,
    /// Distinct keys tracked for top-key reporting
    pub max_tracked_keys: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: L1Config::default(),
            default_l1_ttl: DEFAULT_L1_TTL,
            default_l2_ttl: DEFAULT_L2_TTL,
            default_strategy: WriteStrategy::WriteThrough,
            write_behind_capacity: DEFAULT_WRITE_BEHIND_CAPACITY,
            write_behind_retries: 2,
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
        }
    }
}

impl CacheConfig {
    /// Reject sizes and watermarks that would disable the cache
    pub fn validate(&self) -> Result<()> {
        let l1 = &self.l1;
        if l1.max_entries == 0 {
            return Err(Error::config("cache l1.max_entries must be non-zero"));
        }
        if !(0.0 < l1.low_watermark && l1.low_watermark < l1.high_watermark && l1.high_watermark <= 1.0) {
            return Err(Error::config(format!(
                "cache watermarks must satisfy 0 < low < high <= 1 (got {} / {})",
                l1.low_watermark, l1.high_watermark
            )));
        }
        if self.default_l1_ttl.is_zero() || self.default_l2_ttl.is_zero() {
            return Err(Error::config("cache default TTLs must be non-zero"));
        }
        if self.default_l1_ttl > MAX_TTL || self.default_l2_ttl > MAX_TTL {
            return Err(Error::config(format!(
                "cache default TTLs must not exceed {}s",
                MAX_TTL.as_secs()
            )));
        }
        if self.write_behind_capacity == 0 {
            return Err(Error::config("cache write_behind_capacity must be non-zero"));
        }
        Ok(())
    }
}

// =============================================================================
// Warm-up
// =============================================================================

/// One key to pre-populate
pub struct WarmupItem {
    key: String,
    ttl: Duration,
    loader: BoxFuture<'static, anyhow::Result<Bytes>>,
}

impl WarmupItem {
    /// Pre-populate `key` with the value produced by `loader`
    pub fn new<T, Fut>(key: impl Into<String>, ttl: Duration, loader: Fut) -> Self
    where
        T: Serialize + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            key: key.into(),
            ttl,
            loader: async move {
                let value = loader.await?;
                Ok(codec::encode(&value)?)
            }
            .boxed(),
        }
    }

    /// Key this item populates
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for WarmupItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmupItem")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// A warm-up item whose loader failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupFailure {
    pub key: String,
    pub reason: String,
}

/// Outcome of [`CacheEngine::warmup`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmupReport {
    pub successful: usize,
    pub failed: usize,
    pub failures: Vec<WarmupFailure>,
}

// =============================================================================
// Engine
// =============================================================================

/// Two-tier cache engine
pub struct CacheEngine {
    l1: L1Cache,
    store: Arc<StoreClient>,
    config: CacheConfig,
    metrics: CacheMetrics,
    write_behind: WriteBehindQueue,
    /// Local mirror of the tag index (tag → keys)
    tags: DashMap<String, HashSet<String>>,
    /// Latest known expiry of each tag index
    tag_deadlines: DashMap<String, tokio::time::Instant>,
}

impl CacheEngine {
    /// Create an engine over `store`. Must be called inside a Tokio runtime.
    pub fn new(config: CacheConfig, store: Arc<StoreClient>) -> Self {
        let write_behind = WriteBehindQueue::spawn(
            Arc::clone(&store),
            config.write_behind_capacity,
            config.write_behind_retries,
        );

        Self {
            l1: L1Cache::with_config(config.l1.clone()),
            metrics: CacheMetrics::with_key_limit(config.max_tracked_keys),
            store,
            config,
            write_behind,
            tags: DashMap::new(),
            tag_deadlines: DashMap::new(),
        }
    }

    /// Create with an in-memory store (for testing)
    pub fn in_memory() -> Self {
        Self::new(CacheConfig::default(), Arc::new(StoreClient::in_memory()))
    }

    /// Engine configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Shared store client
    pub fn store(&self) -> &Arc<StoreClient> {
        &self.store
    }

    /// Load options built from the configured defaults
    pub fn default_options(&self) -> LoadOptions {
        LoadOptions {
            l1_ttl: self.config.default_l1_ttl,
            l2_ttl: self.config.default_l2_ttl,
            strategy: self.config.default_strategy,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read through both tiers, running `loader` on a miss.
    ///
    /// Loader errors are returned unchanged and nothing is cached.
    #[instrument(skip(self, loader, options), fields(strategy = %options.strategy))]
    pub async fn get_or_load<T, E, F, Fut>(
        &self,
        key: &str,
        loader: F,
        options: LoadOptions,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.lookup(key, options.l1_ttl).await {
            return Ok(value);
        }

        let value = loader().await.inspect_err(|_| {
            self.metrics.record_error();
        })?;

        self.store_loaded(key, &value, &options).await;
        Ok(value)
    }

    /// Typed read without a loader
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.lookup(key, self.config.default_l1_ttl).await
    }

    /// Serve `key` only if every parent still exists; otherwise drop the
    /// child first so the loader rebuilds it.
    #[instrument(skip(self, loader))]
    pub async fn get_with_hierarchy<T, E, F, Fut>(
        &self,
        key: &str,
        parent_keys: &[&str],
        loader: F,
        ttl: Duration,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        for parent in parent_keys {
            if !self.exists(parent).await {
                debug!(key, parent, "Parent missing, invalidating child");
                self.invalidate(key).await;
                break;
            }
        }

        let options = LoadOptions::with_ttl(ttl).strategy(self.config.default_strategy);
        self.get_or_load(key, loader, options).await
    }

    /// Check either tier for a live key
    pub async fn exists(&self, key: &str) -> bool {
        self.l1.contains(key) || self.store.exists(key).await
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str, l1_ttl: Duration) -> Option<T> {
        let start = Instant::now();
        self.metrics.record_request();

        if let Some(entry) = self.l1.get(key) {
            match codec::decode::<T>(entry.data()) {
                Ok(value) => {
                    self.metrics.record_hit(key, HitSource::L1);
                    self.metrics.record_lookup_latency(start.elapsed());
                    return Some(value);
                }
                Err(e) => {
                    warn!(key, error = %e, "Undecodable L1 entry, dropping");
                    self.metrics.record_error();
                    self.l1.remove(key);
                }
            }
        }

        if let Some(bytes) = self.store.get(key).await {
            match codec::decode::<T>(&bytes) {
                Ok(value) => {
                    self.l1.put(CacheEntry::new(key, bytes, l1_ttl));
                    self.metrics.record_hit(key, HitSource::L2);
                    self.metrics.record_lookup_latency(start.elapsed());
                    return Some(value);
                }
                Err(e) => {
                    warn!(key, error = %e, "Undecodable L2 entry, deleting");
                    self.metrics.record_error();
                    self.store.del(&[key.to_string()]).await;
                }
            }
        }

        self.metrics.record_miss();
        self.metrics.record_lookup_latency(start.elapsed());
        None
    }

    // =========================================================================
    // Writes
    // =========================================================================

    async fn store_loaded<T: Serialize>(&self, key: &str, value: &T, options: &LoadOptions) {
        let bytes = match codec::encode(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "Loaded value not serializable, serving uncached");
                self.metrics.record_error();
                return;
            }
        };

        self.l1.put(CacheEntry::new(key, bytes.clone(), options.l1_ttl));
        let l2_ttl = clamp_ttl(options.l2_ttl);

        match options.strategy {
            WriteStrategy::WriteThrough | WriteStrategy::CacheAside => {
                self.store.set_with_ttl(key, bytes, l2_ttl).await;
            }
            WriteStrategy::WriteBehind => {
                self.write_behind.enqueue(key, bytes, l2_ttl);
            }
        }
    }

    /// Write a value to the chosen tier(s)
    #[instrument(skip(self, value))]
    pub async fn set_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        tier: Tier,
    ) -> Result<()> {
        let bytes = codec::encode(value)?;
        let ttl = clamp_ttl(ttl);

        if tier.includes_l1() {
            self.l1.put(CacheEntry::new(key, bytes.clone(), ttl));
        }
        if tier.includes_l2() {
            self.store.set_with_ttl(key, bytes, ttl).await;
        }
        Ok(())
    }

    /// Write a value to both tiers and index it under each tag
    #[instrument(skip(self, value))]
    pub async fn set_with_tags<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        tags: &[&str],
        ttl: Duration,
    ) -> Result<()> {
        let bytes = codec::encode(value)?;
        let ttl = clamp_ttl(ttl);
        let owned_tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();

        self.l1
            .put(CacheEntry::with_tags(key, bytes.clone(), ttl, owned_tags));
        self.store.set_with_ttl(key, bytes, ttl).await;

        let now = tokio::time::Instant::now();
        let expires_at = expiry_after(now, ttl);
        for tag in tags {
            self.tags
                .entry(tag.to_string())
                .or_default()
                .insert(key.to_string());

            // Tag index lives at least as long as its longest member
            let deadline = {
                let mut known = self
                    .tag_deadlines
                    .entry(tag.to_string())
                    .or_insert(expires_at);
                if *known < expires_at {
                    *known = expires_at;
                }
                *known
            };

            let index = tag_key(tag);
            self.store
                .push(&index, Bytes::copy_from_slice(key.as_bytes()))
                .await;
            self.store
                .expire(&index, clamp_ttl(deadline.saturating_duration_since(now)))
                .await;
        }
        Ok(())
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove a key from both tiers. Invalidating a missing key is a no-op.
    /// Write-behind writes queued for the key are discarded.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, key: &str) {
        self.write_behind.supersede(key);
        if let Some(entry) = self.l1.remove(key) {
            for tag in entry.tags() {
                if let Some(mut members) = self.tags.get_mut(tag) {
                    members.remove(key);
                }
            }
        }
        self.store.del(&[key.to_string()]).await;
    }

    /// Remove every key indexed under `tag`, and the index itself.
    /// Returns the number of distinct keys removed.
    #[instrument(skip(self))]
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut keys: HashSet<String> = self
            .tags
            .remove(tag)
            .map(|(_, members)| members)
            .unwrap_or_default();
        self.tag_deadlines.remove(tag);

        let index = tag_key(tag);
        for raw in self.store.range(&index, 0, -1).await {
            match String::from_utf8(raw.to_vec()) {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(_) => warn!(tag, "Skipping non UTF-8 tag member"),
            }
        }

        for key in &keys {
            self.write_behind.supersede(key);
            self.l1.remove(key);
        }

        let mut doomed: Vec<String> = keys.iter().cloned().collect();
        doomed.push(index);
        self.store.del(&doomed).await;

        debug!(tag, removed = keys.len(), "Invalidated tag");
        keys.len()
    }

    /// Remove every key matching a glob in both tiers.
    /// Returns the number of distinct keys removed.
    #[instrument(skip(self))]
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let compiled = KeyPattern::new(pattern)?;

        self.write_behind.supersede_matching(|key| compiled.matches(key));
        let mut keys: HashSet<String> = self.l1.remove_matching(&compiled).into_iter().collect();
        let remote = self.store.keys(pattern).await;
        self.store.del(&remote).await;
        keys.extend(remote);

        debug!(pattern, removed = keys.len(), "Invalidated pattern");
        Ok(keys.len())
    }

    // =========================================================================
    // Warm-up
    // =========================================================================

    /// Pre-populate both tiers. Loaders run concurrently; one failing loader
    /// does not affect the others.
    #[instrument(skip(self, items), fields(count = items.len()))]
    pub async fn warmup(&self, items: Vec<WarmupItem>) -> WarmupReport {
        let outcomes = join_all(items.into_iter().map(|item| async move {
            let WarmupItem { key, ttl, loader } = item;
            match loader.await {
                Ok(bytes) => {
                    let ttl = clamp_ttl(ttl);
                    self.l1.put(CacheEntry::new(key.as_str(), bytes.clone(), ttl));
                    self.store.set_with_ttl(&key, bytes, ttl).await;
                    Ok(())
                }
                Err(e) => Err(WarmupFailure {
                    key,
                    reason: format!("{:#}", e),
                }),
            }
        }))
        .await;

        let mut report = WarmupReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(()) => report.successful += 1,
                Err(failure) => {
                    warn!(key = %failure.key, reason = %failure.reason, "Warm-up loader failed");
                    report.failed += 1;
                    report.failures.push(failure);
                }
            }
        }

        info!(
            successful = report.successful,
            failed = report.failed,
            "Cache warm-up complete"
        );
        report
    }

    // =========================================================================
    // Write-behind
    // =========================================================================

    /// Wait for queued write-behind writes
    pub async fn flush_writes(&self) -> Result<()> {
        self.write_behind.flush().await
    }

    /// Observe write-behind writes that did not reach L2
    pub fn subscribe_write_failures(&self) -> broadcast::Receiver<WriteBehindFailure> {
        self.write_behind.subscribe_failures()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Get cache statistics with the `top_n` most-hit keys
    pub fn stats(&self, top_n: usize) -> CacheStats {
        let l1 = self.l1.stats();
        let health = self.store.health();
        CacheStats {
            total_requests: self.metrics.total_requests(),
            l1_hits: self.metrics.l1_hits(),
            l2_hits: self.metrics.l2_hits(),
            misses: self.metrics.misses(),
            errors: self.metrics.errors(),
            hit_rate: self.metrics.hit_rate(),
            l1_entries: l1.entries,
            l1_evictions: l1.evictions,
            l2_keys: self.store.stats().key_count,
            l2_failures: health.failures,
            l2_timeouts: health.timeouts,
            avg_lookup_latency_us: self.metrics.lookup_latency().as_micros() as u64,
            top_keys: self.metrics.top_keys(top_n),
            write_behind: self.write_behind.stats(),
        }
    }

    /// Reset request and hit counters
    pub fn reset_stats(&self) {
        self.metrics.reset();
        self.l1.reset_counters();
    }

    /// Drop expired L1 entries and lapsed local tag indexes
    pub fn purge_expired(&self) -> usize {
        let now = tokio::time::Instant::now();
        self.tag_deadlines.retain(|tag, deadline| {
            let live = *deadline > now;
            if !live {
                self.tags.remove(tag);
            }
            live
        });
        self.l1.purge_expired()
    }

    /// Empty L1 and the local tag mirror
    pub fn clear_local(&self) {
        self.l1.clear();
        self.tags.clear();
        self.tag_deadlines.clear();
    }

    /// Release memory under pressure: drop expired entries, then evict half
    /// of what remains
    pub fn emergency_cleanup(&self) -> usize {
        let expired = self.purge_expired();
        let evicted = self.l1.shrink(0.5);
        info!(expired, evicted, "Cache emergency cleanup");
        expired + evicted
    }

    /// Install [`emergency_cleanup`](Self::emergency_cleanup) as a cleanup
    /// task on the memory controller
    pub fn register_cleanup(self: &Arc<Self>, controller: &MemoryController) -> CleanupTaskId {
        let engine = Arc::downgrade(self);
        controller.register_cleanup_task("cache-engine", move || {
            let engine = engine.clone();
            async move {
                if let Some(engine) = engine.upgrade() {
                    engine.emergency_cleanup();
                }
                Ok(())
            }
        })
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("l1_entries", &self.l1.len())
            .field("store", &self.store)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

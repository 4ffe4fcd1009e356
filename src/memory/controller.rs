//! Memory Pressure Controller
//!
//! Samples process memory on a fixed period and reacts to the heap ratio:
//!
//! ```text
//!   ratio < 0.50        grow every pool bound by 10% (ceiling 200)
//!   ratio > critical    shrink every pool bound by 20% (floor 10)
//!   ratio > emergency   also run emergency cleanup:
//!                         1. every registered cleanup task, concurrently
//!                         2. every pool halved
//!                         3. allocator trim hint
//! ```
//!
//! Cleanup tasks are isolated from one another: a task that errors or panics
//! is logged and counted, and the rest still run.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use futures::future::{join_all, BoxFuture};
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::pool::{
    buffer_class, buffer_pool_name, release_class, Pool, PoolRegistry, PoolStats,
    DEFAULT_BUFFER_POOL_SIZE,
};
use super::probe::{MemoryProbe, MemoryUsage};
use crate::config::duration_secs;
use crate::error::{Error, Result};
use crate::scheduler::{PeriodicJob, Scheduler};

/// Heap ratio below which pools are allowed to grow
pub const GROW_BELOW_RATIO: f64 = 0.5;

/// Pool bound floor on shrink
const SHRINK_FLOOR: usize = 10;
/// Pool bound ceiling on grow
const GROW_CEILING: usize = 200;

/// Name of the periodic sampling job
pub const SAMPLE_JOB: &str = "memory-sample";

// =============================================================================
// Configuration
// =============================================================================

/// Memory controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Heap ratio reported as warning
    pub warning_threshold: f64,
    /// Heap ratio that shrinks pools
    pub critical_threshold: f64,
    /// Heap ratio that triggers emergency cleanup
    pub emergency_threshold: f64,
    /// Sampling period
    #[serde(with = "duration_secs")]
    pub sample_interval: Duration,
    /// Heap capacity the ratio is measured against
    pub memory_budget_bytes: u64,
    /// Bound of auto-created buffer pools
    pub buffer_pool_max_size: usize,
    /// Issue an allocator trim hint after emergency cleanup
    pub allocator_trim: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.75,
            critical_threshold: 0.85,
            emergency_threshold: 0.95,
            sample_interval: Duration::from_secs(60),
            memory_budget_bytes: 1024 * 1024 * 1024,
            buffer_pool_max_size: DEFAULT_BUFFER_POOL_SIZE,
            allocator_trim: true,
        }
    }
}

impl MemoryConfig {
    /// Reject thresholds that are out of range or out of order
    pub fn validate(&self) -> Result<()> {
        let ordered = 0.0 < self.warning_threshold
            && self.warning_threshold < self.critical_threshold
            && self.critical_threshold < self.emergency_threshold
            && self.emergency_threshold <= 1.0;
        if !ordered {
            return Err(Error::config(format!(
                "memory thresholds must satisfy 0 < warning < critical < emergency <= 1 (got {} / {} / {})",
                self.warning_threshold, self.critical_threshold, self.emergency_threshold
            )));
        }
        if self.sample_interval.is_zero() {
            return Err(Error::config("memory sample_interval must be non-zero"));
        }
        if self.memory_budget_bytes == 0 {
            return Err(Error::config("memory_budget_bytes must be non-zero"));
        }
        Ok(())
    }

    /// Classify a heap ratio
    pub fn level_for(&self, ratio: f64) -> PressureLevel {
        if ratio > self.emergency_threshold {
            PressureLevel::Emergency
        } else if ratio > self.critical_threshold {
            PressureLevel::Critical
        } else if ratio > self.warning_threshold {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }
}

/// Memory pressure levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PressureLevel::Normal => write!(f, "normal"),
            PressureLevel::Warning => write!(f, "warning"),
            PressureLevel::Critical => write!(f, "critical"),
            PressureLevel::Emergency => write!(f, "emergency"),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Handle returned by [`MemoryController::register_cleanup_task`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CleanupTaskId(u64);

type CleanupFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct CleanupTask {
    name: String,
    run: CleanupFn,
}

/// A cleanup task that errored or panicked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub task: String,
    pub reason: String,
}

/// Outcome of an emergency cleanup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub tasks_run: usize,
    pub tasks_failed: usize,
    pub failures: Vec<CleanupFailure>,
    /// Pooled values dropped by halving
    pub pool_values_released: usize,
    pub allocator_trimmed: bool,
    pub duration_ms: u64,
}

/// Outcome of a pool resize pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeReport {
    /// Pools whose bound changed
    pub pools_resized: usize,
    /// Pooled values dropped by the new bounds
    pub values_released: usize,
}

/// Memory controller statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub usage: MemoryUsage,
    pub heap_ratio: f64,
    pub pressure: PressureLevel,
    pub pools: Vec<PoolStats>,
    pub cleanup_tasks: usize,
    pub emergency_cleanups: u64,
    pub optimizations: u64,
    pub cleanup_failures: u64,
}

// =============================================================================
// Controller
// =============================================================================

/// Memory pressure controller
pub struct MemoryController {
    config: MemoryConfig,
    probe: Arc<dyn MemoryProbe>,
    pools: PoolRegistry,
    cleanup_tasks: RwLock<BTreeMap<CleanupTaskId, CleanupTask>>,
    next_task_id: AtomicU64,
    last_usage: RwLock<MemoryUsage>,
    emergency_cleanups: AtomicU64,
    optimizations: AtomicU64,
    cleanup_failures: AtomicU64,
    scheduler: Scheduler,
}

impl MemoryController {
    /// Create a controller reading memory through `probe`
    pub fn new(config: MemoryConfig, probe: Arc<dyn MemoryProbe>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &std::sync::Weak<MemoryController>| {
            let scheduler = Scheduler::new("memory");
            let controller = weak.clone();
            scheduler.add(PeriodicJob::new(SAMPLE_JOB, config.sample_interval, move || {
                let controller = controller.clone();
                async move {
                    if let Some(controller) = controller.upgrade() {
                        controller.sample_tick().await;
                    }
                }
            }));

            Self {
                config,
                probe,
                pools: PoolRegistry::new(),
                cleanup_tasks: RwLock::new(BTreeMap::new()),
                next_task_id: AtomicU64::new(1),
                last_usage: RwLock::new(MemoryUsage::default()),
                emergency_cleanups: AtomicU64::new(0),
                optimizations: AtomicU64::new(0),
                cleanup_failures: AtomicU64::new(0),
                scheduler,
            }
        })
    }

    /// Controller configuration
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Create (or replace) a named object pool
    pub fn create_pool<T, F, R>(&self, name: &str, factory: F, reset: R, max_size: usize) -> Arc<Pool<T>>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        debug!(pool = name, max_size, "Creating pool");
        self.pools.create(name, factory, reset, max_size)
    }

    /// Take a value from a named pool.
    ///
    /// None for an unknown pool or a type mismatch; an empty pool builds a
    /// fresh value.
    pub fn borrow<T: Send + 'static>(&self, name: &str) -> Option<T> {
        self.pools.get::<T>(name).map(|pool| pool.borrow())
    }

    /// Return a value to a named pool. Returns false if it was dropped.
    pub fn release<T: Send + 'static>(&self, name: &str, value: T) -> bool {
        match self.pools.get::<T>(name) {
            Some(pool) => pool.release(value),
            None => false,
        }
    }

    /// Get an empty buffer with capacity of at least `size`
    pub fn get_buffer(&self, size: usize) -> BytesMut {
        match buffer_class(size) {
            Some(class) => self
                .buffer_pool(class)
                .map(|pool| pool.borrow())
                .unwrap_or_else(|| BytesMut::with_capacity(class)),
            None => BytesMut::with_capacity(size),
        }
    }

    /// Return a buffer to its size-class pool. Returns false if it was dropped.
    pub fn release_buffer(&self, buffer: BytesMut) -> bool {
        match release_class(buffer.capacity()).and_then(|class| self.buffer_pool(class)) {
            Some(pool) => pool.release(buffer),
            None => false,
        }
    }

    fn buffer_pool(&self, class: usize) -> Option<Arc<Pool<BytesMut>>> {
        self.pools.get_or_create(
            &buffer_pool_name(class),
            move || BytesMut::with_capacity(class),
            |buf: &mut BytesMut| buf.clear(),
            self.config.buffer_pool_max_size,
        )
    }

    /// Pool registry
    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    // =========================================================================
    // Cleanup tasks
    // =========================================================================

    /// Register a callback run during emergency cleanup
    pub fn register_cleanup_task<F, Fut>(&self, name: impl Into<String>, task: F) -> CleanupTaskId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = CleanupTaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        debug!(task = %name, ?id, "Registered cleanup task");

        self.cleanup_tasks.write().insert(
            id,
            CleanupTask {
                name,
                run: Arc::new(move || task().boxed()),
            },
        );
        id
    }

    /// Remove a cleanup task. Returns false if the id is unknown.
    pub fn unregister_cleanup_task(&self, id: CleanupTaskId) -> bool {
        self.cleanup_tasks.write().remove(&id).is_some()
    }

    /// Number of registered cleanup tasks
    pub fn cleanup_task_count(&self) -> usize {
        self.cleanup_tasks.read().len()
    }

    // =========================================================================
    // Pressure
    // =========================================================================

    /// Take a fresh memory reading
    pub fn current_usage(&self) -> MemoryUsage {
        let usage = self.probe.sample();
        *self.last_usage.write() = usage;
        usage
    }

    /// Most recent reading without sampling again
    pub fn last_usage(&self) -> MemoryUsage {
        *self.last_usage.read()
    }

    /// Current heap ratio
    pub fn heap_ratio(&self) -> f64 {
        self.current_usage().heap_ratio()
    }

    /// Current pressure level
    pub fn pressure_level(&self) -> PressureLevel {
        self.config.level_for(self.heap_ratio())
    }

    /// Whether the heap ratio is above the critical threshold
    pub fn is_pressure_high(&self) -> bool {
        self.pressure_level() >= PressureLevel::Critical
    }

    /// Run every cleanup task concurrently, halve every pool, then hint the
    /// allocator to return freed memory
    #[instrument(skip(self))]
    pub async fn perform_emergency_cleanup(&self) -> CleanupReport {
        let start = Instant::now();

        let tasks: Vec<(String, CleanupFn)> = self
            .cleanup_tasks
            .read()
            .values()
            .map(|t| (t.name.clone(), Arc::clone(&t.run)))
            .collect();

        let outcomes = join_all(tasks.into_iter().map(|(name, run)| async move {
            let outcome = AssertUnwindSafe(async move { run().await })
                .catch_unwind()
                .await;
            (name, outcome)
        }))
        .await;

        let mut report = CleanupReport {
            tasks_run: outcomes.len(),
            ..Default::default()
        };

        for (task, outcome) in outcomes {
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            let failure = Error::CleanupTask {
                task: task.clone(),
                reason: reason.clone(),
            };
            error!(error = %failure, "Cleanup task failed");
            report.failures.push(CleanupFailure { task, reason });
        }
        report.tasks_failed = report.failures.len();
        self.cleanup_failures
            .fetch_add(report.tasks_failed as u64, Ordering::Relaxed);

        for pool in self.pools.controls() {
            report.pool_values_released += pool.shrink_to(pool.size() / 2);
        }

        report.allocator_trimmed = self.config.allocator_trim && trim_allocator();
        report.duration_ms = start.elapsed().as_millis() as u64;
        self.emergency_cleanups.fetch_add(1, Ordering::Relaxed);

        info!(
            tasks_run = report.tasks_run,
            tasks_failed = report.tasks_failed,
            released = report.pool_values_released,
            duration_ms = report.duration_ms,
            "Emergency cleanup complete"
        );
        report
    }

    /// Shrink every pool bound by 20% (floor 10)
    #[instrument(skip(self))]
    pub fn optimize_usage(&self) -> ResizeReport {
        // 80% of the bound, rounded down
        let report = self.resize_pools(|max| (max * 4 / 5).max(SHRINK_FLOOR).min(max));
        self.optimizations.fetch_add(1, Ordering::Relaxed);
        info!(
            pools_resized = report.pools_resized,
            released = report.values_released,
            "Pools shrunk"
        );
        report
    }

    /// Grow every pool bound by 10% (ceiling 200)
    pub fn grow_pools(&self) -> ResizeReport {
        self.resize_pools(|max| (max + (max / 10).max(1)).min(GROW_CEILING).max(max))
    }

    fn resize_pools(&self, new_bound: impl Fn(usize) -> usize) -> ResizeReport {
        let mut report = ResizeReport::default();
        for pool in self.pools.controls() {
            let max = pool.max_size();
            let target = new_bound(max);
            if target != max {
                let before = pool.size();
                pool.set_max_size(target);
                report.pools_resized += 1;
                report.values_released += before - pool.size();
            }
        }
        report
    }

    /// One sampling pass: read memory and react to the pressure level
    #[instrument(skip(self))]
    pub async fn sample_tick(&self) -> PressureLevel {
        let usage = self.current_usage();
        let ratio = usage.heap_ratio();
        let level = self.config.level_for(ratio);

        match level {
            PressureLevel::Emergency => {
                warn!(ratio, "Memory pressure at emergency level");
                self.optimize_usage();
                self.perform_emergency_cleanup().await;
            }
            PressureLevel::Critical => {
                warn!(ratio, "Memory pressure critical");
                self.optimize_usage();
            }
            _ if ratio < GROW_BELOW_RATIO => {
                self.grow_pools();
            }
            _ => {}
        }

        debug!(ratio, %level, heap_used = usage.heap_used, "Memory sampled");
        level
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start periodic sampling. Returns false if already running.
    pub fn start(&self) -> bool {
        self.scheduler.start()
    }

    /// Stop periodic sampling. Returns false if not running.
    pub async fn stop(&self) -> bool {
        self.scheduler.stop().await
    }

    /// Whether periodic sampling is running
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Sampling scheduler (for pausing and single-stepping)
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // =========================================================================
    // Batch helpers
    // =========================================================================

    /// Process `items` in chunks of `batch_size`, items within a chunk
    /// concurrently. Yields between chunks and cleans up under pressure.
    pub async fn process_batch<T, R, F, Fut>(&self, items: Vec<T>, batch_size: usize, mut f: F) -> Vec<R>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = R>,
    {
        let mut results = Vec::with_capacity(items.len());
        let mut items = items.into_iter().peekable();

        while items.peek().is_some() {
            let chunk: Vec<Fut> = items.by_ref().take(batch_size.max(1)).map(&mut f).collect();
            results.extend(join_all(chunk).await);
            self.relieve_pressure().await;
        }
        results
    }

    /// Consume a stream in chunks of `chunk_size`, handing each chunk to `f`.
    /// Yields between chunks and cleans up under pressure.
    pub async fn process_large_data_stream<S, T, R, F, Fut>(&self, stream: S, chunk_size: usize, mut f: F) -> Vec<R>
    where
        S: Stream<Item = T>,
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = R>,
    {
        let mut chunks = Box::pin(stream.chunks(chunk_size.max(1)));
        let mut results = Vec::new();

        while let Some(chunk) = chunks.next().await {
            results.push(f(chunk).await);
            self.relieve_pressure().await;
        }
        results
    }

    async fn relieve_pressure(&self) {
        if self.is_pressure_high() {
            self.perform_emergency_cleanup().await;
        }
        tokio::task::yield_now().await;
    }

    // =========================================================================
    // Stats
    // =========================================================================

    /// Get controller statistics (takes a fresh reading)
    pub fn stats(&self) -> MemoryStats {
        let usage = self.current_usage();
        MemoryStats {
            usage,
            heap_ratio: usage.heap_ratio(),
            pressure: self.config.level_for(usage.heap_ratio()),
            pools: self.pools.stats(),
            cleanup_tasks: self.cleanup_task_count(),
            emergency_cleanups: self.emergency_cleanups.load(Ordering::Relaxed),
            optimizations: self.optimizations.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
        }
    }
}

/// Reads through the controller's own probe
impl MemoryProbe for MemoryController {
    fn sample(&self) -> MemoryUsage {
        self.current_usage()
    }
}

impl std::fmt::Debug for MemoryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryController")
            .field("pools", &self.pools)
            .field("cleanup_tasks", &self.cleanup_task_count())
            .field("running", &self.is_running())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(all(feature = "malloc-trim", target_os = "linux", target_env = "gnu"))]
fn trim_allocator() -> bool {
    // SAFETY: malloc_trim only releases free heap pages back to the OS
    unsafe { libc::malloc_trim(0) == 1 }
}

#[cfg(not(all(feature = "malloc-trim", target_os = "linux", target_env = "gnu")))]
fn trim_allocator() -> bool {
    false
}

// =============================================================================
// Tests
// =============================================================================

//! Runtime Statistics
//!
//! Lock-free request accounting plus the process probes behind the
//! non-memory fields of a [`MetricSample`](super::MetricSample).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Kernel clock ticks per second assumed for `/proc/self/stat` times
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Timer used to measure runtime scheduling delay
pub const EVENT_LOOP_PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// EMA smoothing factor for the event-loop delay
const DELAY_ALPHA: f64 = 0.2;

// =============================================================================
// Counters
// =============================================================================

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Up/down gauge that never drops below zero
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1 (saturating)
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Set value
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Request tracker
// =============================================================================

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    requests: u64,
    errors: u64,
}

/// Request throughput and error accounting fed by the HTTP layer
#[derive(Debug)]
pub struct RequestTracker {
    requests: Counter,
    errors: Counter,
    active_requests: Gauge,
    active_handles: Gauge,
    window: Mutex<RateWindow>,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    /// Create a tracker with an empty rate window
    pub fn new() -> Self {
        Self {
            requests: Counter::default(),
            errors: Counter::default(),
            active_requests: Gauge::default(),
            active_handles: Gauge::default(),
            window: Mutex::new(RateWindow {
                started: Instant::now(),
                requests: 0,
                errors: 0,
            }),
        }
    }

    /// Mark a request as started. The guard ends it on drop.
    pub fn begin(self: &Arc<Self>) -> RequestGuard {
        self.active_requests.inc();
        RequestGuard {
            tracker: self.clone(),
            failed: false,
        }
    }

    /// Record a finished request that was not tracked with a guard
    pub fn record(&self, failed: bool) {
        self.requests.inc();
        if failed {
            self.errors.inc();
        }
    }

    /// Open connections, sockets or other long-lived handles
    pub fn handles(&self) -> &Gauge {
        &self.active_handles
    }

    /// Total finished requests
    pub fn total_requests(&self) -> u64 {
        self.requests.get()
    }

    /// Total failed requests
    pub fn total_errors(&self) -> u64 {
        self.errors.get()
    }

    /// Requests in flight
    pub fn active_requests(&self) -> u64 {
        self.active_requests.get()
    }

    /// Requests per second and error percent since the previous call,
    /// then start a new window.
    pub fn take_rates(&self) -> (f64, f64) {
        let now = Instant::now();
        let requests = self.requests.get();
        let errors = self.errors.get();

        let mut window = self.window.lock();
        let elapsed = now.duration_since(window.started).as_secs_f64();
        let delta_requests = requests.saturating_sub(window.requests);
        let delta_errors = errors.saturating_sub(window.errors);
        *window = RateWindow {
            started: now,
            requests,
            errors,
        };

        let rps = if elapsed > 0.0 {
            delta_requests as f64 / elapsed
        } else {
            0.0
        };
        let error_rate = if delta_requests > 0 {
            delta_errors as f64 / delta_requests as f64 * 100.0
        } else {
            0.0
        };
        (rps, error_rate)
    }
}

/// In-flight request handle from [`RequestTracker::begin`]
#[derive(Debug)]
pub struct RequestGuard {
    tracker: Arc<RequestTracker>,
    failed: bool,
}

impl RequestGuard {
    /// Count this request as an error when it ends
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.active_requests.dec();
        self.tracker.record(self.failed);
    }
}

// =============================================================================
// Event loop probe
// =============================================================================

/// Measures how late the runtime wakes a short timer
#[derive(Debug, Default)]
pub struct EventLoopProbe {
    /// f64 bits of the smoothed delay in milliseconds
    delay_ms: AtomicU64,
}

impl EventLoopProbe {
    /// Create a probe reporting zero delay
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep one probe interval and fold the overshoot into the average
    pub async fn measure(&self) -> Duration {
        let start = Instant::now();
        tokio::time::sleep(EVENT_LOOP_PROBE_INTERVAL).await;
        let overshoot = start.elapsed().saturating_sub(EVENT_LOOP_PROBE_INTERVAL);
        self.record(overshoot);
        overshoot
    }

    /// Fold one observed delay into the moving average
    pub fn record(&self, delay: Duration) {
        let observed = delay.as_secs_f64() * 1000.0;
        let mut current = self.delay_ms.load(Ordering::Relaxed);
        loop {
            let avg = f64::from_bits(current);
            let next = if avg == 0.0 {
                observed
            } else {
                DELAY_ALPHA * observed + (1.0 - DELAY_ALPHA) * avg
            };
            match self.delay_ms.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Smoothed delay in milliseconds
    pub fn delay_ms(&self) -> f64 {
        f64::from_bits(self.delay_ms.load(Ordering::Relaxed))
    }
}

// =============================================================================
// Providers
// =============================================================================

/// Non-memory runtime figures for one sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub cpu: f64,
    pub event_loop_delay: f64,
    pub active_handles: u64,
    pub active_requests: u64,
    pub requests_per_second: f64,
    pub error_rate: f64,
}

/// Source of runtime figures
#[async_trait]
pub trait RuntimeStatsProvider: Send + Sync {
    /// Take a reading
    async fn sample(&self) -> RuntimeStats;
}

#[derive(Debug)]
struct CpuWindow {
    at: Instant,
    ticks: Option<u64>,
}

/// Reads the current process and a shared [`RequestTracker`]
#[derive(Debug)]
pub struct ProcessRuntimeStats {
    tracker: Arc<RequestTracker>,
    event_loop: EventLoopProbe,
    cpu: Mutex<CpuWindow>,
}

impl ProcessRuntimeStats {
    /// Create a provider over `tracker`
    pub fn new(tracker: Arc<RequestTracker>) -> Self {
        Self {
            tracker,
            event_loop: EventLoopProbe::new(),
            cpu: Mutex::new(CpuWindow {
                at: Instant::now(),
                ticks: cpu_ticks(),
            }),
        }
    }

    /// Request tracker feeding this provider
    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    fn cpu_percent(&self) -> f64 {
        let now = Instant::now();
        let ticks = cpu_ticks();
        let mut window = self.cpu.lock();

        let percent = match (window.ticks, ticks) {
            (Some(before), Some(after)) => {
                let elapsed = now.duration_since(window.at).as_secs_f64();
                if elapsed > 0.0 {
                    after.saturating_sub(before) as f64 / CLOCK_TICKS_PER_SEC / elapsed * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        *window = CpuWindow { at: now, ticks };
        percent
    }
}

#[async_trait]
impl RuntimeStatsProvider for ProcessRuntimeStats {
    async fn sample(&self) -> RuntimeStats {
        self.event_loop.measure().await;
        let (requests_per_second, error_rate) = self.tracker.take_rates();

        RuntimeStats {
            cpu: self.cpu_percent(),
            event_loop_delay: self.event_loop.delay_ms(),
            active_handles: self.tracker.handles().get(),
            active_requests: self.tracker.active_requests(),
            requests_per_second,
            error_rate,
        }
    }
}

/// utime + stime of this process in clock ticks
fn cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    parse_stat_ticks(&stat)
}

fn parse_stat_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields resume after its ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

/// Provider returning whatever was last set (for testing)
#[derive(Debug, Default)]
pub struct ManualRuntimeStats {
    stats: RwLock<RuntimeStats>,
}

impl ManualRuntimeStats {
    /// Create with an initial reading
    pub fn new(stats: RuntimeStats) -> Self {
        Self {
            stats: RwLock::new(stats),
        }
    }

    /// Replace the reading
    pub fn set(&self, stats: RuntimeStats) {
        *self.stats.write() = stats;
    }

    /// Change the reading in place
    pub fn update(&self, f: impl FnOnce(&mut RuntimeStats)) {
        f(&mut self.stats.write());
    }
}

#[async_trait]
impl RuntimeStatsProvider for ManualRuntimeStats {
    async fn sample(&self) -> RuntimeStats {
        *self.stats.read()
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Health Checks
//!
//! Liveness/readiness flags plus component checks for memory, the shared
//! store and the monitor itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::store::StoreClient;

/// Heap ratio at or above which the process reports unhealthy
pub const HEALTHY_HEAP_RATIO: f64 = 0.90;

/// Key probed by the store check
const STORE_PROBE_KEY: &str = "performance:health";

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    /// Operational with reduced capability
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy or degraded
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Check if status is healthy
    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// One component check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl HealthCheckResult {
    fn with_status(name: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message,
            duration_ms: 0,
        }
    }

    /// Create a healthy result
    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    /// Create a degraded result
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    /// Create an unhealthy result
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Set duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Aggregate health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status among the checks
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthResponse {
    /// Aggregate component checks
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }

    /// Check result by name
    pub fn check(&self, name: &str) -> Option<&HealthCheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

// =============================================================================
// Component checks
// =============================================================================

/// Healthy while the heap ratio stays below [`HEALTHY_HEAP_RATIO`]
pub fn memory_check(heap_ratio: f64) -> HealthCheckResult {
    if heap_ratio < HEALTHY_HEAP_RATIO {
        HealthCheckResult::healthy("memory")
    } else {
        HealthCheckResult::unhealthy(
            "memory",
            format!("heap at {:.0}% of budget", heap_ratio * 100.0),
        )
    }
}

/// Round-trip to the shared store. An unreachable store only degrades
/// service since reads fall back to the local tier.
pub async fn store_check(store: &StoreClient) -> HealthCheckResult {
    let start = Instant::now();
    let result = match store.try_exists(STORE_PROBE_KEY).await {
        Ok(_) => HealthCheckResult::healthy("store"),
        Err(e) => HealthCheckResult::degraded("store", e.to_string()),
    };
    result.with_duration(start.elapsed())
}

/// Healthy while periodic monitoring runs
pub fn monitor_check(monitoring: bool) -> HealthCheckResult {
    if monitoring {
        HealthCheckResult::healthy("monitor")
    } else {
        HealthCheckResult::degraded("monitor", "monitoring stopped")
    }
}

// =============================================================================
// Probe flags
// =============================================================================

/// Liveness and readiness flags for the HTTP probes
pub struct HealthCheck {
    start_time: Instant,
    live: AtomicBool,
    ready: AtomicBool,
}

impl HealthCheck {
    /// Live but not yet ready
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    /// Get uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Check liveness
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    /// Check readiness
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Set liveness
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    /// Set readiness
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Liveness as a check result
    pub fn liveness_check(&self) -> HealthCheckResult {
        if self.is_live() {
            HealthCheckResult::healthy("liveness")
        } else {
            HealthCheckResult::unhealthy("liveness", "Service not live")
        }
    }

    /// Readiness as a check result
    pub fn readiness_check(&self) -> HealthCheckResult {
        if self.is_ready() {
            HealthCheckResult::healthy("readiness")
        } else {
            HealthCheckResult::unhealthy("readiness", "Service not ready")
        }
    }

    /// Probe flags plus the given component checks
    pub fn check_all(&self, components: Vec<HealthCheckResult>) -> HealthResponse {
        let mut checks = vec![self.liveness_check(), self.readiness_check()];
        checks.extend(components);
        HealthResponse::new(checks, self.uptime())
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheck")
            .field("live", &self.is_live())
            .field("ready", &self.is_ready())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

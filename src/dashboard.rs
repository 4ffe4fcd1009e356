//! Performance Dashboard
//!
//! Operator facade over the cache engine, the memory controller and the
//! monitor: read-only queries, validated administrative changes and on-demand
//! optimisation.
//!
//! Administrative payloads are validated completely before anything changes;
//! a malformed payload returns [`Error::Config`] and leaves state untouched.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::cache::{CacheEngine, CacheStats};
use crate::config::PerfConfig;
use crate::error::{Error, Result};
use crate::memory::{CleanupReport, MemoryController, MemoryProbe, MemoryStats, ResizeReport};
use crate::monitor::{
    memory_check, monitor_check, store_check, AlertEvent, AlertRule, AlertThresholds, Granularity,
    HealthCheck, HealthResponse, MetricBucket, MetricSample, MonitorState, MonitorStats,
    PerformanceMonitor, PerformanceReport, RuntimeStatsProvider, Severity, SystemStatus,
};
use crate::store::StoreClient;

/// Top keys returned by [`PerformanceDashboard::snapshot`]
pub const SNAPSHOT_TOP_KEYS: usize = 10;

/// What an on-demand optimisation touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizeCategory {
    /// Drop expired cache entries and lapsed tag indexes
    Cache,
    /// Shrink pool bounds
    Memory,
    /// Run the emergency cleanup
    Cleanup,
    All,
}

impl FromStr for OptimizeCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cache" => Ok(OptimizeCategory::Cache),
            "memory" => Ok(OptimizeCategory::Memory),
            "cleanup" => Ok(OptimizeCategory::Cleanup),
            "all" => Ok(OptimizeCategory::All),
            other => Err(Error::config(format!(
                "unknown optimization category '{}' (expected cache|memory|cleanup|all)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for OptimizeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizeCategory::Cache => write!(f, "cache"),
            OptimizeCategory::Memory => write!(f, "memory"),
            OptimizeCategory::Cleanup => write!(f, "cleanup"),
            OptimizeCategory::All => write!(f, "all"),
        }
    }
}

/// Outcome of [`PerformanceDashboard::optimize`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationReport {
    pub category: OptimizeCategory,
    pub cache_entries_purged: Option<usize>,
    pub pools: Option<ResizeReport>,
    pub cleanup: Option<CleanupReport>,
}

/// All bucket series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryView {
    pub hourly: Vec<MetricBucket>,
    pub daily: Vec<MetricBucket>,
    pub weekly: Vec<MetricBucket>,
}

/// One-call overview for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub current: Option<MetricSample>,
    pub status: SystemStatus,
    pub monitor: MonitorStats,
    pub cache: CacheStats,
    pub memory: MemoryStats,
    pub alerts_last_hour: usize,
}

/// Operator facade over the performance core
pub struct PerformanceDashboard {
    monitor: Arc<PerformanceMonitor>,
    cache: Arc<CacheEngine>,
    memory: Arc<MemoryController>,
    health: Arc<HealthCheck>,
}

impl PerformanceDashboard {
    /// Facade over already constructed services
    pub fn new(
        monitor: Arc<PerformanceMonitor>,
        cache: Arc<CacheEngine>,
        memory: Arc<MemoryController>,
    ) -> Self {
        Self {
            monitor,
            cache,
            memory,
            health: Arc::new(HealthCheck::new()),
        }
    }

    /// Build and wire every service from configuration: the cache registers
    /// its cleanup with the memory controller, and the monitor reads memory
    /// through the controller.
    pub fn assemble(
        config: &PerfConfig,
        store: Arc<StoreClient>,
        memory_probe: Arc<dyn MemoryProbe>,
        runtime: Arc<dyn RuntimeStatsProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(CacheEngine::new(config.cache.clone(), store.clone()));
        let memory = MemoryController::new(config.memory.clone(), memory_probe);
        cache.register_cleanup(&memory);

        // Without configured rules the monitor derives them from the
        // thresholds, so threshold updates also retarget alerting
        let mut builder = PerformanceMonitor::builder(store)
            .config(config.monitor.clone())
            .thresholds(config.thresholds.clone())
            .runtime_stats(runtime)
            .cache(cache.clone())
            .memory_controller(memory.clone());
        if !config.rules.is_empty() {
            builder = builder.rules(config.rules.clone());
        }
        let monitor = builder.build()?;

        Ok(Self::new(monitor, cache, memory))
    }

    /// Start memory sampling and monitoring, then report ready
    pub fn start(&self) {
        self.memory.start();
        self.monitor.start();
        self.health.set_ready(true);
        info!("Performance core started");
    }

    /// Stop periodic work and flush queued cache writes
    pub async fn stop(&self) {
        self.health.set_ready(false);
        self.monitor.stop().await;
        self.memory.stop().await;
        if let Err(e) = self.cache.flush_writes().await {
            tracing::warn!(error = %e, "Write-behind flush failed during shutdown");
        }
        info!("Performance core stopped");
    }

    /// Monitor service
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Cache engine
    pub fn cache(&self) -> &Arc<CacheEngine> {
        &self.cache
    }

    /// Memory controller
    pub fn memory(&self) -> &Arc<MemoryController> {
        &self.memory
    }

    /// Probe flags
    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Latest realtime sample
    pub fn current_metrics(&self) -> Option<MetricSample> {
        self.monitor.current()
    }

    /// One bucket series
    pub fn history(&self, granularity: Granularity) -> Vec<MetricBucket> {
        self.monitor.history(granularity)
    }

    /// Every bucket series
    pub fn history_all(&self) -> HistoryView {
        HistoryView {
            hourly: self.monitor.history(Granularity::Hourly),
            daily: self.monitor.history(Granularity::Daily),
            weekly: self.monitor.history(Granularity::Weekly),
        }
    }

    /// Alerts raised within `window`, newest first
    pub fn recent_alerts(&self, window: Duration, severity: Option<Severity>) -> Vec<AlertEvent> {
        self.monitor.get_recent_alerts(window, severity)
    }

    /// Cache statistics with the `top_n` most hit keys
    pub fn cache_stats(&self, top_n: usize) -> CacheStats {
        self.cache.stats(top_n)
    }

    /// Memory statistics including the pool table
    pub fn memory_stats(&self) -> MemoryStats {
        self.memory.stats()
    }

    /// Latest report, generating one if none exists yet
    pub async fn report(&self) -> PerformanceReport {
        match self.monitor.latest_report() {
            Some(report) => report,
            None => self.monitor.generate_report().await,
        }
    }

    /// Recommendations of the latest report
    pub async fn recommendations(&self) -> Vec<String> {
        self.report().await.recommendations
    }

    /// Overview of every service
    pub fn snapshot(&self) -> DashboardSnapshot {
        let current = self.monitor.current();
        let thresholds = self.monitor.thresholds();
        DashboardSnapshot {
            status: current
                .as_ref()
                .map(|s| SystemStatus::evaluate(s, &thresholds))
                .unwrap_or(SystemStatus::Healthy),
            current,
            monitor: self.monitor.stats(),
            cache: self.cache.stats(SNAPSHOT_TOP_KEYS),
            memory: self.memory.stats(),
            alerts_last_hour: self
                .monitor
                .get_recent_alerts(Duration::from_secs(3600), None)
                .len(),
        }
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Replace the alert thresholds
    pub fn update_thresholds(&self, thresholds: AlertThresholds) -> Result<()> {
        self.monitor.replace_thresholds(thresholds)
    }

    /// Replace the alert thresholds from a JSON payload
    pub fn update_thresholds_json(&self, payload: &serde_json::Value) -> Result<()> {
        let thresholds: AlertThresholds = parse_payload("thresholds", payload)?;
        self.update_thresholds(thresholds)
    }

    /// Replace the alert rule set
    pub fn update_rules(&self, rules: Vec<AlertRule>) -> Result<()> {
        self.monitor.replace_rules(rules)
    }

    /// Replace the alert rule set from a JSON array payload
    pub fn update_rules_json(&self, payload: &serde_json::Value) -> Result<()> {
        let rules: Vec<AlertRule> = parse_payload("rules", payload)?;
        self.update_rules(rules)
    }

    /// Run an on-demand optimisation
    #[instrument(skip(self))]
    pub async fn optimize(&self, category: OptimizeCategory) -> OptimizationReport {
        let mut report = OptimizationReport {
            category,
            cache_entries_purged: None,
            pools: None,
            cleanup: None,
        };

        if matches!(category, OptimizeCategory::Cache | OptimizeCategory::All) {
            report.cache_entries_purged = Some(self.cache.purge_expired());
        }
        if matches!(category, OptimizeCategory::Memory | OptimizeCategory::All) {
            report.pools = Some(self.memory.optimize_usage());
        }
        if matches!(category, OptimizeCategory::Cleanup | OptimizeCategory::All) {
            report.cleanup = Some(self.memory.perform_emergency_cleanup().await);
        }

        info!(%category, "On-demand optimization complete");
        report
    }

    /// Optimise by category name (`cache|memory|cleanup|all`)
    pub async fn optimize_named(&self, category: &str) -> Result<OptimizationReport> {
        let category = category.parse()?;
        Ok(self.optimize(category).await)
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Component health: memory (healthy iff heap ratio < 0.90), shared
    /// store reachability and monitor state
    pub async fn health_check(&self) -> HealthResponse {
        HealthResponse::new(self.component_checks().await, self.health.uptime())
    }

    /// Readiness: probe flags plus component health
    pub async fn readiness(&self) -> HealthResponse {
        self.health.check_all(self.component_checks().await)
    }

    async fn component_checks(&self) -> Vec<crate::monitor::HealthCheckResult> {
        vec![
            memory_check(self.memory.heap_ratio()),
            store_check(self.monitor.store()).await,
            monitor_check(self.monitor.state() == MonitorState::Monitoring),
        ]
    }
}

impl std::fmt::Debug for PerformanceDashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceDashboard")
            .field("monitor", &self.monitor)
            .field("memory", &self.memory)
            .finish()
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(what: &str, payload: &serde_json::Value) -> Result<T> {
    T::deserialize(payload).map_err(|e| Error::config(format!("malformed {} payload: {}", what, e)))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ManualMemoryProbe;
    use crate::monitor::{Comparator, HealthStatus, ManualRuntimeStats, MetricKind};
    use crate::store::InMemoryStore;
    use assert_matches::assert_matches;
    use serde_json::json;

    struct Fixture {
        dashboard: PerformanceDashboard,
        probe: Arc<ManualMemoryProbe>,
        runtime: Arc<ManualRuntimeStats>,
        backend: Arc<InMemoryStore>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryStore::new());
        let store = Arc::new(StoreClient::new(backend.clone(), Duration::from_millis(50)));
        let probe = Arc::new(ManualMemoryProbe::at_ratio(1_000, 0.3));
        let runtime = Arc::new(ManualRuntimeStats::default());
        let dashboard = PerformanceDashboard::assemble(
            &PerfConfig::default(),
            store,
            probe.clone(),
            runtime.clone(),
        )
        .unwrap();
        Fixture {
            dashboard,
            probe,
            runtime,
            backend,
        }
    }

    #[tokio::test]
    async fn test_assemble_wires_services() {
        let f = fixture();
        assert_eq!(f.dashboard.memory().cleanup_task_count(), 1);
        assert_eq!(f.dashboard.monitor().rules().len(), 4);
        assert!(f.dashboard.monitor().cache().is_some());
    }

    #[tokio::test]
    async fn test_malformed_thresholds_leave_state_untouched() {
        let f = fixture();
        let before = f.dashboard.monitor().thresholds();

        let result = f.dashboard.update_thresholds_json(&json!({ "cpu": "high" }));
        assert_matches!(result, Err(Error::Config(_)));
        let result = f.dashboard.update_thresholds_json(&json!({ "memoryRatio": 3.0 }));
        assert_matches!(result, Err(Error::Config(_)));
        assert_eq!(f.dashboard.monitor().thresholds(), before);

        f.dashboard
            .update_thresholds_json(&json!({ "cpu": 95.0 }))
            .unwrap();
        assert_eq!(f.dashboard.monitor().thresholds().cpu, 95.0);
    }

    #[tokio::test]
    async fn test_threshold_update_retargets_alerting() {
        let f = fixture();
        f.runtime.update(|s| s.cpu = 70.0);
        f.dashboard.monitor().sample_now().await;
        assert!(f.dashboard.recent_alerts(Duration::from_secs(60), None).is_empty());

        f.dashboard
            .update_thresholds(AlertThresholds {
                cpu: 50.0,
                ..Default::default()
            })
            .unwrap();
        f.dashboard.monitor().sample_now().await;

        let alerts = f.dashboard.recent_alerts(Duration::from_secs(60), None);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule.metric, MetricKind::Cpu);
        assert_eq!(alerts[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_malformed_rules_leave_state_untouched() {
        let f = fixture();
        let before = f.dashboard.monitor().rules();

        let payload = json!([
            { "metric": "cpu", "threshold": 50, "comparator": "gt" },
            { "metric": "cpu", "threshold": 50, "comparator": "between" }
        ]);
        assert_matches!(f.dashboard.update_rules_json(&payload), Err(Error::Config(_)));
        assert_matches!(
            f.dashboard.update_rules_json(&json!({ "metric": "cpu" })),
            Err(Error::Config(_))
        );
        assert_eq!(f.dashboard.monitor().rules(), before);

        f.dashboard
            .update_rules_json(&json!([{ "metric": "errorRate", "threshold": 1, "comparator": "gt" }]))
            .unwrap();
        let rules = f.dashboard.monitor().rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].metric, MetricKind::ErrorRate);
        assert_eq!(rules[0].comparator, Comparator::Gt);
    }

    #[tokio::test]
    async fn test_optimize_categories() {
        let f = fixture();
        f.dashboard
            .memory()
            .create_pool("rows", Vec::<u8>::new, |v: &mut Vec<u8>| v.clear(), 100);

        let report = f.dashboard.optimize(OptimizeCategory::Memory).await;
        assert_eq!(report.pools.unwrap().pools_resized, 1);
        assert!(report.cleanup.is_none());
        assert!(report.cache_entries_purged.is_none());

        let report = f.dashboard.optimize(OptimizeCategory::All).await;
        assert!(report.cache_entries_purged.is_some());
        assert_eq!(report.cleanup.unwrap().tasks_run, 1);

        assert_matches!(f.dashboard.optimize_named("disk").await, Err(Error::Config(_)));
        let report = f.dashboard.optimize_named("CLEANUP").await.unwrap();
        assert_eq!(report.category, OptimizeCategory::Cleanup);
    }

    #[tokio::test]
    async fn test_health_follows_heap_ratio() {
        let f = fixture();
        f.dashboard.start();

        let health = f.dashboard.health_check().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(f.dashboard.readiness().await.status.is_healthy());

        f.probe.set_ratio(0.92);
        let health = f.dashboard.health_check().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.check("memory").unwrap().status, HealthStatus::Unhealthy);

        f.probe.set_ratio(0.3);
        f.backend.set_available(false);
        let health = f.dashboard.health_check().await;
        assert_eq!(health.status, HealthStatus::Degraded);

        f.dashboard.stop().await;
        assert!(!f.dashboard.health().is_ready());
    }

    #[tokio::test]
    async fn test_queries() {
        let f = fixture();
        assert!(f.dashboard.current_metrics().is_none());

        f.dashboard.monitor().sample_now().await;
        assert!(f.dashboard.current_metrics().is_some());
        assert!(f.dashboard.history_all().hourly.is_empty());

        let recs = f.dashboard.recommendations().await;
        assert!(!recs.is_empty());

        let snapshot = f.dashboard.snapshot();
        assert_eq!(snapshot.status, SystemStatus::Healthy);
        assert_eq!(snapshot.monitor.realtime_samples, 1);
        assert!(f.dashboard.memory_stats().pools.is_empty());
        assert_eq!(f.dashboard.cache_stats(5).total_requests, 0);
    }
}

//! Performance Monitor
//!
//! Owns the four periodic pipelines:
//!
//! ```text
//!   realtime-sample       1s    sample → alert rules → ring buffer
//!   summary-rollup       60s    60 pending samples → hourly bucket
//!   retention-compaction 600s   hourly → daily → weekly → purged
//!   report-generation    300s   status + trend + recommendations
//! ```
//!
//! Every pipeline can also be single-stepped through [`Scheduler::run_now`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::alerts::{AlertEngine, AlertEvent, AlertRule, AlertStats, AlertThresholds, Severity};
use super::history::{CompactionReport, MetricsHistory};
use super::report::{PerformanceReport, ReportInputs};
use super::runtime::{ProcessRuntimeStats, RequestTracker, RuntimeStatsProvider};
use super::sample::{Granularity, MetricBucket, MetricKind, MetricSample};
use crate::cache::CacheEngine;
use crate::clock::{system_clock, SharedClock};
use crate::config::duration_secs;
use crate::error::{Error, Result};
use crate::memory::{MemoryConfig, MemoryController, MemoryProbe, ProcessMemoryProbe};
use crate::scheduler::{PeriodicJob, Scheduler};
use crate::store::{codec, StoreClient, ALERTS_KEY, LATEST_REPORT_KEY};

/// Realtime sampling job
pub const REALTIME_JOB: &str = "realtime-sample";
/// Hourly rollup job
pub const ROLLUP_JOB: &str = "summary-rollup";
/// Retention compaction job
pub const COMPACTION_JOB: &str = "retention-compaction";
/// Report generation job
pub const REPORT_JOB: &str = "report-generation";

/// Top keys included in report cache stats
const REPORT_TOP_KEYS: usize = 10;

/// Alerts from this far back feed the report
const REPORT_ALERT_WINDOW: Duration = Duration::from_secs(3600);

const BROADCAST_CAPACITY: usize = 256;

// =============================================================================
// Configuration
// =============================================================================

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_secs")]
    pub realtime_interval: Duration,
    #[serde(with = "duration_secs")]
    pub rollup_interval: Duration,
    #[serde(with = "duration_secs")]
    pub compaction_interval: Duration,
    #[serde(with = "duration_secs")]
    pub report_interval: Duration,
    /// Expiry of the persisted realtime ring buffer
    #[serde(with = "duration_secs")]
    pub realtime_ttl: Duration,
    /// Expiry of the persisted latest report
    #[serde(with = "duration_secs")]
    pub report_ttl: Duration,
    /// Alert events kept locally and in the store
    pub alert_history_size: usize,
    /// Expiry of the persisted alert list
    #[serde(with = "duration_secs")]
    pub alert_ttl: Duration,
    /// Cooldown of escalated alerts per metric
    #[serde(with = "duration_secs")]
    pub critical_cooldown: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            realtime_interval: Duration::from_secs(1),
            rollup_interval: Duration::from_secs(60),
            compaction_interval: Duration::from_secs(600),
            report_interval: Duration::from_secs(300),
            realtime_ttl: Duration::from_secs(300),
            report_ttl: Duration::from_secs(600),
            alert_history_size: 1000,
            alert_ttl: Duration::from_secs(86_400),
            critical_cooldown: super::alerts::DEFAULT_CRITICAL_COOLDOWN,
        }
    }
}

impl MonitorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("realtime_interval", self.realtime_interval),
            ("rollup_interval", self.rollup_interval),
            ("compaction_interval", self.compaction_interval),
            ("report_interval", self.report_interval),
            ("realtime_ttl", self.realtime_ttl),
            ("report_ttl", self.report_ttl),
            ("alert_ttl", self.alert_ttl),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::config(format!("monitor {} must be non-zero", name)));
        }
        if self.alert_history_size == 0 {
            return Err(Error::config("monitor alert_history_size must be non-zero"));
        }
        Ok(())
    }
}

/// Monitor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Stopped,
    Monitoring,
}

/// Monitor statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStats {
    pub state: MonitorState,
    pub alerts: AlertStats,
    pub recent_alerts: usize,
    pub realtime_samples: usize,
    pub pending_samples: usize,
    pub hourly_buckets: usize,
    pub daily_buckets: usize,
    pub weekly_buckets: usize,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`PerformanceMonitor`]
pub struct MonitorBuilder {
    store: Arc<StoreClient>,
    config: MonitorConfig,
    thresholds: AlertThresholds,
    rules: Option<Vec<AlertRule>>,
    clock: SharedClock,
    memory_probe: Option<Arc<dyn MemoryProbe>>,
    runtime: Option<Arc<dyn RuntimeStatsProvider>>,
    cache: Option<Arc<CacheEngine>>,
    memory: Option<Arc<MemoryController>>,
}

impl MonitorBuilder {
    /// Set configuration
    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set thresholds (also seed the default rule set)
    pub fn thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Use an explicit rule set instead of the threshold defaults. Explicit
    /// rules are kept when thresholds are replaced later.
    pub fn rules(mut self, rules: Vec<AlertRule>) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Set the wall clock
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Read memory through `probe`
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = Some(probe);
        self
    }

    /// Read runtime figures through `provider`
    pub fn runtime_stats(mut self, provider: Arc<dyn RuntimeStatsProvider>) -> Self {
        self.runtime = Some(provider);
        self
    }

    /// Read process runtime figures, with requests counted by `tracker`
    pub fn request_tracker(mut self, tracker: Arc<RequestTracker>) -> Self {
        self.runtime = Some(Arc::new(ProcessRuntimeStats::new(tracker)));
        self
    }

    /// Include cache statistics in reports
    pub fn cache(mut self, cache: Arc<CacheEngine>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attach the memory controller: it becomes the memory source (unless a
    /// probe is set) and receives optimisation requests on critical memory
    /// alerts
    pub fn memory_controller(mut self, controller: Arc<MemoryController>) -> Self {
        self.memory = Some(controller);
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<Arc<PerformanceMonitor>> {
        self.config.validate()?;
        self.thresholds.validate()?;

        let rules_follow_thresholds = self.rules.is_none();
        let rules = self
            .rules
            .unwrap_or_else(|| self.thresholds.default_rules());
        let alerts = AlertEngine::new(rules, self.config.critical_cooldown, self.clock.clone())?;

        let memory_probe: Arc<dyn MemoryProbe> = match (self.memory_probe, &self.memory) {
            (Some(probe), _) => probe,
            (None, Some(controller)) => controller.clone() as Arc<dyn MemoryProbe>,
            (None, None) => Arc::new(ProcessMemoryProbe::new(
                MemoryConfig::default().memory_budget_bytes,
            )),
        };
        let runtime = self
            .runtime
            .unwrap_or_else(|| Arc::new(ProcessRuntimeStats::new(Arc::new(RequestTracker::new()))));

        let history = MetricsHistory::new(self.store.clone(), self.clock.clone(), self.config.realtime_ttl);
        let (alert_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (report_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let config = self.config;

        Ok(Arc::new_cyclic(|weak: &std::sync::Weak<PerformanceMonitor>| {
            let scheduler = Scheduler::new("monitor");
            let jobs = [
                (REALTIME_JOB, config.realtime_interval),
                (ROLLUP_JOB, config.rollup_interval),
                (COMPACTION_JOB, config.compaction_interval),
                (REPORT_JOB, config.report_interval),
            ];
            for (name, period) in jobs {
                let monitor = weak.clone();
                scheduler.add(PeriodicJob::new(name, period, move || {
                    let monitor = monitor.clone();
                    async move {
                        if let Some(monitor) = monitor.upgrade() {
                            monitor.run_job(name).await;
                        }
                    }
                }));
            }

            PerformanceMonitor {
                alert_history: Mutex::new(VecDeque::with_capacity(config.alert_history_size)),
                config,
                clock: self.clock,
                store: self.store,
                memory_probe,
                runtime,
                alerts,
                thresholds: RwLock::new(self.thresholds),
                rules_follow_thresholds: AtomicBool::new(rules_follow_thresholds),
                history,
                latest_report: RwLock::new(None),
                alert_tx,
                report_tx,
                cache: self.cache,
                memory: self.memory,
                scheduler,
            }
        }))
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Metrics collector, alerting and report pipeline
pub struct PerformanceMonitor {
    config: MonitorConfig,
    clock: SharedClock,
    store: Arc<StoreClient>,
    memory_probe: Arc<dyn MemoryProbe>,
    runtime: Arc<dyn RuntimeStatsProvider>,
    alerts: AlertEngine,
    thresholds: RwLock<AlertThresholds>,
    /// Rule set is derived from the thresholds (no explicit rules given)
    rules_follow_thresholds: AtomicBool,
    history: MetricsHistory,
    alert_history: Mutex<VecDeque<AlertEvent>>,
    latest_report: RwLock<Option<PerformanceReport>>,
    alert_tx: broadcast::Sender<AlertEvent>,
    report_tx: broadcast::Sender<PerformanceReport>,
    cache: Option<Arc<CacheEngine>>,
    memory: Option<Arc<MemoryController>>,
    scheduler: Scheduler,
}

impl PerformanceMonitor {
    /// Start building a monitor persisting through `store`
    pub fn builder(store: Arc<StoreClient>) -> MonitorBuilder {
        MonitorBuilder {
            store,
            config: MonitorConfig::default(),
            thresholds: AlertThresholds::default(),
            rules: None,
            clock: system_clock(),
            memory_probe: None,
            runtime: None,
            cache: None,
            memory: None,
        }
    }

    /// Monitor configuration
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    async fn run_job(&self, name: &str) {
        match name {
            REALTIME_JOB => {
                self.sample_now().await;
            }
            ROLLUP_JOB => {
                self.history.rollup().await;
            }
            COMPACTION_JOB => {
                self.history.compact().await;
            }
            REPORT_JOB => {
                self.generate_report().await;
            }
            _ => warn!(job = name, "Unknown monitor job"),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Enter Monitoring. Returns false if already monitoring.
    pub fn start(&self) -> bool {
        let started = self.scheduler.start();
        if started {
            info!(
                realtime = ?self.config.realtime_interval,
                rules = self.alerts.rules().len(),
                "Performance monitoring started"
            );
        }
        started
    }

    /// Return to Stopped, letting an in-flight tick finish.
    /// Returns false if already stopped.
    pub async fn stop(&self) -> bool {
        let stopped = self.scheduler.stop().await;
        if stopped {
            info!("Performance monitoring stopped");
        }
        stopped
    }

    /// Current lifecycle state
    pub fn state(&self) -> MonitorState {
        if self.scheduler.is_running() {
            MonitorState::Monitoring
        } else {
            MonitorState::Stopped
        }
    }

    /// Periodic job scheduler (for pausing and single-stepping)
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Reload bucket series persisted by a previous process
    pub async fn restore_history(&self) -> usize {
        let restored = self.history.restore().await;
        if restored > 0 {
            info!(buckets = restored, "Metric history restored");
        }
        restored
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Take a sample without recording it
    pub async fn capture(&self) -> MetricSample {
        let memory = self.memory_probe.sample();
        let runtime = self.runtime.sample().await;

        MetricSample {
            timestamp: self.clock.now(),
            cpu: runtime.cpu,
            memory,
            event_loop_delay: runtime.event_loop_delay,
            active_handles: runtime.active_handles,
            active_requests: runtime.active_requests,
            requests_per_second: runtime.requests_per_second,
            error_rate: runtime.error_rate,
        }
    }

    /// One realtime tick: capture, evaluate rules, record
    pub async fn sample_now(&self) -> MetricSample {
        let sample = self.capture().await;
        self.ingest(sample.clone()).await;
        sample
    }

    /// Evaluate rules against an externally produced sample and record it
    #[instrument(skip(self, sample), fields(timestamp = %sample.timestamp))]
    pub async fn ingest(&self, sample: MetricSample) -> Vec<AlertEvent> {
        let events = self.alerts.evaluate(&sample);
        for event in &events {
            self.record_alert(event.clone()).await;
        }
        self.history.record(sample).await;
        events
    }

    async fn record_alert(&self, event: AlertEvent) {
        {
            let mut history = self.alert_history.lock();
            history.push_back(event.clone());
            while history.len() > self.config.alert_history_size {
                history.pop_front();
            }
        }

        if event.severity == Severity::Critical
            && matches!(event.rule.metric, MetricKind::MemoryRatio | MetricKind::HeapUsed)
        {
            if let Some(memory) = &self.memory {
                warn!(value = event.observed_value, "Critical memory alert, shrinking pools");
                memory.optimize_usage();
            }
        }

        match codec::encode(&event) {
            Ok(bytes) => {
                self.store
                    .push_capped(ALERTS_KEY, bytes, self.config.alert_history_size, self.config.alert_ttl)
                    .await;
            }
            Err(e) => warn!(error = %e, "Failed to encode alert event"),
        }

        // No subscribers is fine
        let _ = self.alert_tx.send(event);
    }

    /// Run the hourly rollup now
    pub async fn rollup_now(&self) -> Option<MetricBucket> {
        self.history.rollup().await
    }

    /// Run retention compaction now
    pub async fn compact_now(&self) -> CompactionReport {
        self.history.compact().await
    }

    /// Build, persist and broadcast a report
    #[instrument(skip(self))]
    pub async fn generate_report(&self) -> PerformanceReport {
        let snapshot = self.history.latest();
        let hourly = self.history.series(Granularity::Hourly);
        let recent_alerts = self.get_recent_alerts(REPORT_ALERT_WINDOW, None);
        let inputs = ReportInputs {
            snapshot: snapshot.as_ref(),
            thresholds: self.thresholds(),
            hourly: &hourly,
            recent_alerts: &recent_alerts,
            cache: self.cache.as_ref().map(|c| c.stats(REPORT_TOP_KEYS)),
            memory: self.memory.as_ref().map(|m| m.stats()),
        };
        let report = PerformanceReport::build(inputs, self.clock.now());

        match codec::encode(&report) {
            Ok(bytes) => {
                self.store
                    .set_with_ttl(LATEST_REPORT_KEY, bytes, self.config.report_ttl)
                    .await;
            }
            Err(e) => warn!(error = %e, "Failed to encode report"),
        }

        *self.latest_report.write() = Some(report.clone());
        let _ = self.report_tx.send(report.clone());

        debug!(status = %report.status, recommendations = report.recommendations.len(), "Report generated");
        report
    }

    // =========================================================================
    // Reconfiguration
    // =========================================================================

    /// Replace the rule set; applies from the next sampling tick. The new
    /// rules are explicit and survive later threshold changes.
    pub fn replace_rules(&self, rules: Vec<AlertRule>) -> Result<()> {
        let _thresholds = self.thresholds.write();
        self.alerts.replace_rules(rules)?;
        self.rules_follow_thresholds.store(false, Ordering::Release);
        info!(rules = self.alerts.rules().len(), "Alert rules replaced");
        Ok(())
    }

    /// Replace the thresholds. Report status uses them from the next report;
    /// a rule set derived from thresholds is rebuilt and applies from the
    /// next sampling tick. Nothing changes if validation fails.
    pub fn replace_thresholds(&self, thresholds: AlertThresholds) -> Result<()> {
        thresholds.validate()?;
        let mut current = self.thresholds.write();
        let rebuilt = self.rules_follow_thresholds.load(Ordering::Acquire);
        if rebuilt {
            self.alerts.replace_rules(thresholds.default_rules())?;
        }
        *current = thresholds;
        info!(rules_rebuilt = rebuilt, "Alert thresholds replaced");
        Ok(())
    }

    /// Current rule set
    pub fn rules(&self) -> Vec<AlertRule> {
        self.alerts.rules()
    }

    /// Current thresholds
    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds.read().clone()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Most recent sample
    pub fn current(&self) -> Option<MetricSample> {
        self.history.latest()
    }

    /// Realtime ring buffer, oldest first
    pub fn realtime(&self) -> Vec<MetricSample> {
        self.history.realtime()
    }

    /// Bucket series, oldest first
    pub fn history(&self, granularity: Granularity) -> Vec<MetricBucket> {
        self.history.series(granularity)
    }

    /// Alerts raised within `window`, newest first, optionally one severity
    pub fn get_recent_alerts(&self, window: Duration, severity: Option<Severity>) -> Vec<AlertEvent> {
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::weeks(52));
        self.alert_history
            .lock()
            .iter()
            .rev()
            .filter(|e| e.timestamp >= cutoff)
            .filter(|e| severity.map_or(true, |s| e.severity == s))
            .cloned()
            .collect()
    }

    /// Last generated report
    pub fn latest_report(&self) -> Option<PerformanceReport> {
        self.latest_report.read().clone()
    }

    /// Subscribe to alert events
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alert_tx.subscribe()
    }

    /// Subscribe to generated reports
    pub fn subscribe_reports(&self) -> broadcast::Receiver<PerformanceReport> {
        self.report_tx.subscribe()
    }

    /// Attached cache engine
    pub fn cache(&self) -> Option<&Arc<CacheEngine>> {
        self.cache.as_ref()
    }

    /// Attached memory controller
    pub fn memory(&self) -> Option<&Arc<MemoryController>> {
        self.memory.as_ref()
    }

    /// Shared store client
    pub fn store(&self) -> &Arc<StoreClient> {
        &self.store
    }

    /// Get monitor statistics
    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            state: self.state(),
            alerts: self.alerts.stats(),
            recent_alerts: self.alert_history.lock().len(),
            realtime_samples: self.history.realtime().len(),
            pending_samples: self.history.pending_len(),
            hourly_buckets: self.history.series(Granularity::Hourly).len(),
            daily_buckets: self.history.series(Granularity::Daily).len(),
            weekly_buckets: self.history.series(Granularity::Weekly).len(),
        }
    }
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("state", &self.state())
            .field("alerts", &self.alerts)
            .field("history", &self.history)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::{ManualMemoryProbe, MemoryUsage};
    use crate::monitor::alerts::Comparator;
    use crate::monitor::runtime::{ManualRuntimeStats, RuntimeStats};
    use crate::store::InMemoryStore;
    use assert_matches::assert_matches;

    struct Fixture {
        monitor: Arc<PerformanceMonitor>,
        clock: Arc<ManualClock>,
        probe: Arc<ManualMemoryProbe>,
        runtime: Arc<ManualRuntimeStats>,
        store: Arc<StoreClient>,
    }

    fn fixture(rules: Vec<AlertRule>) -> Fixture {
        build_fixture(Some(rules))
    }

    fn build_fixture(rules: Option<Vec<AlertRule>>) -> Fixture {
        let clock = ManualClock::starting_now();
        let probe = Arc::new(ManualMemoryProbe::at_ratio(1_000, 0.3));
        let runtime = Arc::new(ManualRuntimeStats::default());
        let store = Arc::new(StoreClient::new(
            Arc::new(InMemoryStore::new()),
            Duration::from_millis(250),
        ));
        let mut builder = PerformanceMonitor::builder(store.clone())
            .clock(clock.clone())
            .memory_probe(probe.clone())
            .runtime_stats(runtime.clone());
        if let Some(rules) = rules {
            builder = builder.rules(rules);
        }
        let monitor = builder.build().unwrap();
        Fixture {
            monitor,
            clock,
            probe,
            runtime,
            store,
        }
    }

    #[tokio::test]
    async fn test_sample_reads_probes() {
        let f = fixture(vec![]);
        f.runtime.set(RuntimeStats {
            cpu: 12.5,
            requests_per_second: 40.0,
            ..Default::default()
        });

        let sample = f.monitor.sample_now().await;
        assert_eq!(sample.cpu, 12.5);
        assert_eq!(sample.requests_per_second, 40.0);
        assert_eq!(sample.memory.heap_used, 300);
        assert_eq!(f.monitor.current(), Some(sample));
    }

    #[tokio::test]
    async fn test_alert_cooldown_through_monitor() {
        let rule = AlertRule::new(MetricKind::Cpu, Comparator::Gt, 100.0)
            .with_cooldown(Duration::from_secs(60));
        let f = fixture(vec![rule]);
        f.runtime.update(|s| s.cpu = 150.0);

        f.monitor.sample_now().await;
        f.clock.advance(Duration::from_secs(10));
        f.monitor.sample_now().await;
        assert_eq!(f.monitor.get_recent_alerts(Duration::from_secs(3600), None).len(), 1);

        f.clock.advance(Duration::from_secs(60));
        f.monitor.sample_now().await;
        assert_eq!(f.monitor.get_recent_alerts(Duration::from_secs(3600), None).len(), 2);

        // Persisted to the bounded alert list
        assert_eq!(f.store.range(ALERTS_KEY, 0, -1).await.len(), 2);
    }

    #[tokio::test]
    async fn test_recent_alerts_filtering() {
        let f = fixture(vec![
            AlertRule::new(MetricKind::Cpu, Comparator::Gt, 40.0),
            AlertRule::new(MetricKind::ErrorRate, Comparator::Gt, 5.0),
        ]);
        f.runtime.set(RuntimeStats {
            cpu: 90.0,
            error_rate: 6.0,
            ..Default::default()
        });
        f.monitor.sample_now().await;

        let all = f.monitor.get_recent_alerts(Duration::from_secs(60), None);
        assert_eq!(all.len(), 2);
        let critical = f.monitor.get_recent_alerts(Duration::from_secs(60), Some(Severity::Critical));
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].rule.metric, MetricKind::Cpu);

        f.clock.advance(Duration::from_secs(120));
        assert!(f.monitor.get_recent_alerts(Duration::from_secs(60), None).is_empty());
    }

    #[tokio::test]
    async fn test_rules_replaced_between_ticks() {
        let f = fixture(vec![]);
        f.runtime.update(|s| s.cpu = 70.0);
        assert!(f.monitor.sample_now().await.cpu > 0.0);
        assert!(f.monitor.get_recent_alerts(Duration::from_secs(60), None).is_empty());

        f.monitor
            .replace_rules(vec![AlertRule::new(MetricKind::Cpu, Comparator::Gt, 50.0)])
            .unwrap();
        f.monitor.sample_now().await;
        assert_eq!(f.monitor.get_recent_alerts(Duration::from_secs(60), None).len(), 1);

        let bad = AlertThresholds {
            cpu: 0.0,
            ..Default::default()
        };
        assert_matches!(f.monitor.replace_thresholds(bad), Err(Error::Config(_)));
        assert_eq!(f.monitor.thresholds(), AlertThresholds::default());
    }

    #[tokio::test]
    async fn test_threshold_change_rebuilds_derived_rules() {
        let f = build_fixture(None);
        f.runtime.update(|s| s.cpu = 70.0);
        assert!(f.monitor.sample_now().await.cpu > 0.0);
        assert!(f.monitor.get_recent_alerts(Duration::from_secs(60), None).is_empty());

        f.monitor
            .replace_thresholds(AlertThresholds {
                cpu: 50.0,
                ..Default::default()
            })
            .unwrap();
        let cpu_rule = f
            .monitor
            .rules()
            .into_iter()
            .find(|r| r.metric == MetricKind::Cpu)
            .unwrap();
        assert_eq!(cpu_rule.threshold, 50.0);

        f.monitor.sample_now().await;
        let alerts = f.monitor.get_recent_alerts(Duration::from_secs(60), None);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule.metric, MetricKind::Cpu);
    }

    #[tokio::test]
    async fn test_threshold_change_keeps_explicit_rules() {
        let explicit = vec![AlertRule::new(MetricKind::ErrorRate, Comparator::Gt, 2.0)];
        let f = fixture(explicit.clone());
        f.monitor
            .replace_thresholds(AlertThresholds {
                cpu: 50.0,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(f.monitor.rules(), explicit);
        assert_eq!(f.monitor.thresholds().cpu, 50.0);

        // Rules replaced at runtime are explicit too
        let f = build_fixture(None);
        let replaced = vec![AlertRule::new(MetricKind::Cpu, Comparator::Gt, 95.0)];
        f.monitor.replace_rules(replaced.clone()).unwrap();
        f.monitor
            .replace_thresholds(AlertThresholds {
                cpu: 50.0,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(f.monitor.rules(), replaced);
    }

    #[tokio::test]
    async fn test_alert_subscription() {
        let f = fixture(vec![AlertRule::new(MetricKind::MemoryRatio, Comparator::Gt, 0.2)]);
        let mut rx = f.monitor.subscribe_alerts();

        f.monitor.sample_now().await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.rule.metric, MetricKind::MemoryRatio);
        assert_eq!(event.severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_critical_memory_alert_shrinks_pools() {
        let clock = ManualClock::starting_now();
        let probe = Arc::new(ManualMemoryProbe::at_ratio(1_000, 0.9));
        let controller = MemoryController::new(MemoryConfig::default(), probe);
        controller.create_pool("rows", Vec::<u8>::new, |v: &mut Vec<u8>| v.clear(), 100);

        let monitor = PerformanceMonitor::builder(Arc::new(StoreClient::in_memory()))
            .rules(vec![AlertRule::new(MetricKind::MemoryRatio, Comparator::Gt, 0.4)])
            .clock(clock)
            .runtime_stats(Arc::new(ManualRuntimeStats::default()))
            .memory_controller(controller.clone())
            .build()
            .unwrap();

        let sample = monitor.sample_now().await;
        assert!(sample.memory.heap_ratio() > 0.8);
        assert_eq!(controller.pools().stats()[0].max_size, 80);
    }

    #[tokio::test]
    async fn test_report_persisted_and_broadcast() {
        let f = fixture(vec![]);
        let mut rx = f.monitor.subscribe_reports();
        f.probe.set(MemoryUsage {
            heap_used: 950,
            heap_total: 1_000,
            rss: 950,
            external: 0,
        });
        f.monitor.sample_now().await;

        let report = f.monitor.generate_report().await;
        assert_eq!(report.status, crate::monitor::SystemStatus::Critical);
        assert!(f.store.exists(LATEST_REPORT_KEY).await);
        assert_eq!(rx.recv().await.unwrap().id, report.id);
        assert_eq!(f.monitor.latest_report().unwrap().id, report.id);
    }

    #[tokio::test]
    async fn test_jobs_single_step() {
        let f = fixture(vec![]);
        for _ in 0..60 {
            assert!(f.monitor.scheduler().run_now(REALTIME_JOB).await);
        }
        assert!(f.monitor.scheduler().run_now(ROLLUP_JOB).await);
        assert!(f.monitor.scheduler().run_now(COMPACTION_JOB).await);
        assert!(f.monitor.scheduler().run_now(REPORT_JOB).await);

        let stats = f.monitor.stats();
        assert_eq!(stats.state, MonitorState::Stopped);
        assert_eq!(stats.hourly_buckets, 1);
        assert_eq!(stats.pending_samples, 0);
        assert!(f.monitor.latest_report().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_state() {
        let f = fixture(vec![]);
        assert_eq!(f.monitor.state(), MonitorState::Stopped);

        assert!(f.monitor.start());
        assert!(!f.monitor.start());
        assert_eq!(f.monitor.state(), MonitorState::Monitoring);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(f.monitor.scheduler().runs(REALTIME_JOB), Some(3));

        assert!(f.monitor.stop().await);
        assert_eq!(f.monitor.state(), MonitorState::Stopped);
        assert_eq!(f.monitor.realtime().len(), 3);
    }

    #[test]
    fn test_config_validation() {
        assert!(MonitorConfig::default().validate().is_ok());
        let bad = MonitorConfig {
            rollup_interval: Duration::ZERO,
            ..Default::default()
        };
        assert_matches!(bad.validate(), Err(Error::Config(_)));
    }
}

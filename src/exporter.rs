//! Prometheus Exposition
//!
//! Mirrors dashboard statistics into a private [`Registry`] and renders the
//! text format served on `/metrics`. Cumulative totals are exported as
//! counters advanced by the difference since the last update, so a
//! `reset_stats` on the cache never moves a counter backwards.

use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::dashboard::PerformanceDashboard;
use crate::error::Result;
use crate::memory::PressureLevel;
use crate::monitor::{MonitorState, Severity};

/// Window for the recent alert gauges
const RECENT_ALERT_WINDOW: Duration = Duration::from_secs(3600);

/// Prometheus view of the performance core
pub struct MetricsExporter {
    registry: Registry,

    // Cache
    cache_lookups: IntCounterVec,
    cache_hit_rate: Gauge,
    cache_l1_entries: IntGauge,
    cache_l1_evictions: IntCounter,
    store_failures: IntCounterVec,
    write_behind_pending: IntGauge,

    // Memory
    heap_ratio: Gauge,
    heap_used: IntGauge,
    rss: IntGauge,
    pressure_level: IntGauge,
    pool_size: IntGaugeVec,
    pool_max_size: IntGaugeVec,
    emergency_cleanups: IntCounter,

    // Monitor
    monitoring: IntGauge,
    cpu: Gauge,
    event_loop_delay: Gauge,
    requests_per_second: Gauge,
    error_rate: Gauge,
    alerts_emitted: IntCounter,
    alerts_suppressed: IntCounter,
    recent_alerts: IntGaugeVec,
}

impl MetricsExporter {
    /// Create and register every metric
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("perfcore".to_string()), None)?;

        let cache_lookups = IntCounterVec::new(
            Opts::new("cache_lookups_total", "Cache lookups by outcome"),
            &["outcome"],
        )?;
        let cache_hit_rate = Gauge::new("cache_hit_rate", "Combined L1/L2 hit rate")?;
        let cache_l1_entries = IntGauge::new("cache_l1_entries", "Entries held in the local tier")?;
        let cache_l1_evictions =
            IntCounter::new("cache_l1_evictions_total", "Local tier capacity evictions")?;
        let store_failures = IntCounterVec::new(
            Opts::new("store_failures_total", "Shared store calls that degraded to a miss"),
            &["kind"],
        )?;
        let write_behind_pending =
            IntGauge::new("write_behind_pending", "Queued write-behind operations")?;

        let heap_ratio = Gauge::new("memory_heap_ratio", "Heap used over heap total")?;
        let heap_used = IntGauge::new("memory_heap_used_bytes", "Heap bytes in use")?;
        let rss = IntGauge::new("memory_rss_bytes", "Resident set size")?;
        let pressure_level = IntGauge::new(
            "memory_pressure_level",
            "0=normal 1=warning 2=critical 3=emergency",
        )?;
        let pool_size = IntGaugeVec::new(
            Opts::new("pool_size", "Idle values held by a pool"),
            &["pool"],
        )?;
        let pool_max_size = IntGaugeVec::new(
            Opts::new("pool_max_size", "Current pool bound"),
            &["pool"],
        )?;
        let emergency_cleanups =
            IntCounter::new("memory_emergency_cleanups_total", "Emergency cleanups run")?;

        let monitoring = IntGauge::new("monitor_running", "1 while the monitor is sampling")?;
        let cpu = Gauge::new("system_cpu_percent", "Process CPU usage")?;
        let event_loop_delay =
            Gauge::new("system_event_loop_delay_ms", "Scheduler delay observed by the runtime probe")?;
        let requests_per_second = Gauge::new("system_requests_per_second", "Request throughput")?;
        let error_rate = Gauge::new("system_error_rate_percent", "Failed requests percentage")?;
        let alerts_emitted = IntCounter::new("alerts_emitted_total", "Alert events raised")?;
        let alerts_suppressed =
            IntCounter::new("alerts_suppressed_total", "Breaches suppressed by a cooldown")?;
        let recent_alerts = IntGaugeVec::new(
            Opts::new("alerts_recent", "Alerts raised in the last hour"),
            &["severity"],
        )?;

        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(cache_hit_rate.clone()))?;
        registry.register(Box::new(cache_l1_entries.clone()))?;
        registry.register(Box::new(cache_l1_evictions.clone()))?;
        registry.register(Box::new(store_failures.clone()))?;
        registry.register(Box::new(write_behind_pending.clone()))?;
        registry.register(Box::new(heap_ratio.clone()))?;
        registry.register(Box::new(heap_used.clone()))?;
        registry.register(Box::new(rss.clone()))?;
        registry.register(Box::new(pressure_level.clone()))?;
        registry.register(Box::new(pool_size.clone()))?;
        registry.register(Box::new(pool_max_size.clone()))?;
        registry.register(Box::new(emergency_cleanups.clone()))?;
        registry.register(Box::new(monitoring.clone()))?;
        registry.register(Box::new(cpu.clone()))?;
        registry.register(Box::new(event_loop_delay.clone()))?;
        registry.register(Box::new(requests_per_second.clone()))?;
        registry.register(Box::new(error_rate.clone()))?;
        registry.register(Box::new(alerts_emitted.clone()))?;
        registry.register(Box::new(alerts_suppressed.clone()))?;
        registry.register(Box::new(recent_alerts.clone()))?;

        Ok(Self {
            registry,
            cache_lookups,
            cache_hit_rate,
            cache_l1_entries,
            cache_l1_evictions,
            store_failures,
            write_behind_pending,
            heap_ratio,
            heap_used,
            rss,
            pressure_level,
            pool_size,
            pool_max_size,
            emergency_cleanups,
            monitoring,
            cpu,
            event_loop_delay,
            requests_per_second,
            error_rate,
            alerts_emitted,
            alerts_suppressed,
            recent_alerts,
        })
    }

    /// Underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Refresh every metric from the dashboard
    pub fn update(&self, dashboard: &PerformanceDashboard) {
        let cache = dashboard.cache_stats(0);
        advance(&self.cache_lookups.with_label_values(&["l1_hit"]), cache.l1_hits);
        advance(&self.cache_lookups.with_label_values(&["l2_hit"]), cache.l2_hits);
        advance(&self.cache_lookups.with_label_values(&["miss"]), cache.misses);
        advance(&self.cache_lookups.with_label_values(&["error"]), cache.errors);
        self.cache_hit_rate.set(cache.hit_rate);
        self.cache_l1_entries.set(cache.l1_entries as i64);
        advance(&self.cache_l1_evictions, cache.l1_evictions);
        advance(&self.store_failures.with_label_values(&["failure"]), cache.l2_failures);
        advance(&self.store_failures.with_label_values(&["timeout"]), cache.l2_timeouts);
        self.write_behind_pending.set(cache.write_behind.pending as i64);

        let memory = dashboard.memory_stats();
        self.heap_ratio.set(memory.heap_ratio);
        self.heap_used.set(memory.usage.heap_used as i64);
        self.rss.set(memory.usage.rss as i64);
        self.pressure_level.set(match memory.pressure {
            PressureLevel::Normal => 0,
            PressureLevel::Warning => 1,
            PressureLevel::Critical => 2,
            PressureLevel::Emergency => 3,
        });
        // Removed pools must not linger
        self.pool_size.reset();
        self.pool_max_size.reset();
        for pool in &memory.pools {
            self.pool_size
                .with_label_values(&[pool.name.as_str()])
                .set(pool.size as i64);
            self.pool_max_size
                .with_label_values(&[pool.name.as_str()])
                .set(pool.max_size as i64);
        }
        advance(&self.emergency_cleanups, memory.emergency_cleanups);

        let monitor = dashboard.monitor().stats();
        self.monitoring
            .set(i64::from(monitor.state == MonitorState::Monitoring));
        advance(&self.alerts_emitted, monitor.alerts.emitted);
        advance(&self.alerts_suppressed, monitor.alerts.suppressed);

        if let Some(sample) = dashboard.current_metrics() {
            self.cpu.set(sample.cpu);
            self.event_loop_delay.set(sample.event_loop_delay);
            self.requests_per_second.set(sample.requests_per_second);
            self.error_rate.set(sample.error_rate);
        }

        for severity in [Severity::Warning, Severity::Critical] {
            let count = dashboard
                .recent_alerts(RECENT_ALERT_WINDOW, Some(severity))
                .len();
            self.recent_alerts
                .with_label_values(&[severity.to_string().as_str()])
                .set(count as i64);
        }
    }

    /// Text exposition of the registry
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Content type of [`render`](Self::render)
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter").finish_non_exhaustive()
    }
}

/// Move a counter up to `total`; a lower total (stats reset) is ignored
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Tier;
    use crate::config::PerfConfig;
    use crate::memory::ManualMemoryProbe;
    use crate::monitor::ManualRuntimeStats;
    use crate::store::StoreClient;
    use std::sync::Arc;

    fn dashboard() -> PerformanceDashboard {
        PerformanceDashboard::assemble(
            &PerfConfig::default(),
            Arc::new(StoreClient::in_memory()),
            Arc::new(ManualMemoryProbe::at_ratio(1_000, 0.4)),
            Arc::new(ManualRuntimeStats::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_advance_never_decreases() {
        let counter = IntCounter::new("c", "c").unwrap();
        advance(&counter, 5);
        advance(&counter, 3);
        assert_eq!(counter.get(), 5);
        advance(&counter, 8);
        assert_eq!(counter.get(), 8);
    }

    #[tokio::test]
    async fn test_update_and_render() {
        let dashboard = dashboard();
        dashboard
            .memory()
            .create_pool("rows", Vec::<u8>::new, |v: &mut Vec<u8>| v.clear(), 50);
        dashboard
            .cache()
            .set_with_ttl("k", &1u32, Duration::from_secs(60), Tier::Both)
            .await
            .unwrap();
        let _: Option<u32> = dashboard.cache().get("k").await;
        let _: Option<u32> = dashboard.cache().get("absent").await;

        let exporter = MetricsExporter::new().unwrap();
        exporter.update(&dashboard);
        let text = exporter.render().unwrap();

        assert!(text.contains("perfcore_cache_lookups_total{outcome=\"l1_hit\"} 1"));
        assert!(text.contains("perfcore_cache_lookups_total{outcome=\"miss\"} 1"));
        assert!(text.contains("perfcore_memory_heap_ratio 0.4"));
        assert!(text.contains("perfcore_pool_max_size{pool=\"rows\"} 50"));
        assert!(text.contains("perfcore_monitor_running 0"));
        assert!(exporter.content_type().starts_with("text/plain"));
    }

    #[tokio::test]
    async fn test_removed_pool_disappears() {
        let dashboard = dashboard();
        dashboard
            .memory()
            .create_pool("tmp", Vec::<u8>::new, |v: &mut Vec<u8>| v.clear(), 10);
        let exporter = MetricsExporter::new().unwrap();
        exporter.update(&dashboard);
        assert!(exporter.render().unwrap().contains("pool=\"tmp\""));

        dashboard.memory().pools().remove("tmp");
        exporter.update(&dashboard);
        assert!(!exporter.render().unwrap().contains("pool=\"tmp\""));
    }
}

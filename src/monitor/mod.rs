//! Metrics Collection & Alerting
//!
//! Periodic sampling, threshold alerts with cooldowns, time-bucketed history
//! and report generation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        PerformanceMonitor                                │
//! │        Stopped ⇄ Monitoring (four jobs on one Scheduler)                 │
//! ├──────────────────┬──────────────────┬──────────────────┬─────────────────┤
//! │  dyn MemoryProbe │  AlertEngine     │  MetricsHistory  │  Report builder │
//! │  dyn Runtime     │  rule cooldowns  │  ring → hourly → │  status, trend, │
//! │  StatsProvider   │  critical bucket │  daily → weekly  │  recommendations│
//! └──────────────────┴──────────────────┴──────────────────┴─────────────────┘
//!          │                                     │
//!          ▼                                     ▼
//!   MemoryController (optimize on        StoreClient (performance:* keys)
//!   critical memory alerts)
//! ```

mod alerts;
mod health;
mod history;
#[allow(clippy::module_inception)]
mod monitor;
mod report;
mod runtime;
mod sample;

pub use alerts::{
    AlertEngine, AlertEvent, AlertRule, AlertStats, AlertThresholds, Comparator, Severity,
    DEFAULT_CRITICAL_COOLDOWN, DEFAULT_RULE_COOLDOWN_SECS,
};
pub use health::{
    memory_check, monitor_check, store_check, HealthCheck, HealthCheckResult, HealthResponse,
    HealthStatus, HEALTHY_HEAP_RATIO,
};
pub use history::{
    CompactionReport, MetricsHistory, DAILY_CAPACITY, HOURLY_CAPACITY, REALTIME_CAPACITY,
    ROLLUP_SAMPLES, WEEKLY_CAPACITY,
};
pub use monitor::{
    MonitorBuilder, MonitorConfig, MonitorState, MonitorStats, PerformanceMonitor,
    COMPACTION_JOB, REALTIME_JOB, REPORT_JOB, ROLLUP_JOB,
};
pub use report::{
    recommendations, AlertSummary, PerformanceReport, ReportInputs, SystemStatus, Trend,
    TrendDirection, TREND_WINDOW,
};
pub use runtime::{
    Counter, EventLoopProbe, Gauge, ManualRuntimeStats, ProcessRuntimeStats, RequestGuard,
    RequestTracker, RuntimeStats, RuntimeStatsProvider,
};
pub use sample::{Granularity, MetricBucket, MetricKind, MetricSample};

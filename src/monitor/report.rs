//! Performance Reports
//!
//! A report combines the latest snapshot, a short memory trend over the
//! hourly series, alert volume and the cache/memory statistics into a status
//! plus rule-based recommendations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::alerts::{AlertEvent, AlertThresholds, Severity};
use super::sample::{MetricBucket, MetricKind, MetricSample};
use crate::cache::CacheStats;
use crate::memory::MemoryStats;

/// Buckets on each side of the trend comparison
pub const TREND_WINDOW: usize = 6;

/// Memory-ratio change below which the trend counts as stable
pub const TREND_TOLERANCE: f64 = 0.02;

/// Fraction of a threshold at which status turns to warning
pub const WARNING_FRACTION: f64 = 0.8;

/// Alerts per hour considered noisy
pub const ALERT_VOLUME_LIMIT: usize = 10;

/// Hit rate under which caching is flagged, once traffic is meaningful
const LOW_HIT_RATE: f64 = 0.5;
const MIN_CACHE_REQUESTS: u64 = 100;

/// Overall system status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Healthy,
    Warning,
    Critical,
}

impl SystemStatus {
    /// Status of a snapshot against the thresholds: critical when any limit
    /// is exceeded, warning when any metric is within 80% of its limit.
    pub fn evaluate(sample: &MetricSample, thresholds: &AlertThresholds) -> Self {
        let metrics = [
            MetricKind::Cpu,
            MetricKind::MemoryRatio,
            MetricKind::EventLoopDelay,
            MetricKind::ErrorRate,
        ];

        metrics
            .iter()
            .filter_map(|&metric| {
                let limit = thresholds.limit(metric)?;
                let value = sample.value(metric);
                Some(if value > limit {
                    SystemStatus::Critical
                } else if value > limit * WARNING_FRACTION {
                    SystemStatus::Warning
                } else {
                    SystemStatus::Healthy
                })
            })
            .max()
            .unwrap_or(SystemStatus::Healthy)
    }
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemStatus::Healthy => write!(f, "healthy"),
            SystemStatus::Warning => write!(f, "warning"),
            SystemStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Direction of the memory trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

/// Recent versus prior memory ratio over the hourly series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trend {
    pub recent_memory_ratio: f64,
    pub prior_memory_ratio: f64,
    pub memory_ratio_delta: f64,
    pub direction: TrendDirection,
}

impl Trend {
    /// Compare the newest [`TREND_WINDOW`] buckets with the ones before them.
    /// `None` until both windows are full.
    pub fn from_buckets(buckets: &[MetricBucket]) -> Option<Self> {
        if buckets.len() < TREND_WINDOW * 2 {
            return None;
        }
        let split = buckets.len() - TREND_WINDOW;
        let recent = &buckets[split..];
        let prior = &buckets[split - TREND_WINDOW..split];

        let mean = |window: &[MetricBucket]| {
            window.iter().map(|b| b.memory_ratio).sum::<f64>() / window.len() as f64
        };
        let recent_memory_ratio = mean(recent);
        let prior_memory_ratio = mean(prior);
        let delta = recent_memory_ratio - prior_memory_ratio;

        let direction = if delta > TREND_TOLERANCE {
            TrendDirection::Degrading
        } else if delta < -TREND_TOLERANCE {
            TrendDirection::Improving
        } else {
            TrendDirection::Stable
        };

        Some(Self {
            recent_memory_ratio,
            prior_memory_ratio,
            memory_ratio_delta: delta,
            direction,
        })
    }
}

/// Alert counts over the report window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSummary {
    pub total: usize,
    pub warning: usize,
    pub critical: usize,
}

impl AlertSummary {
    /// Count events by severity
    pub fn from_events(events: &[AlertEvent]) -> Self {
        let critical = events.iter().filter(|e| e.severity == Severity::Critical).count();
        Self {
            total: events.len(),
            warning: events.len() - critical,
            critical,
        }
    }
}

/// Everything a report is derived from
#[derive(Debug, Clone, Default)]
pub struct ReportInputs<'a> {
    pub snapshot: Option<&'a MetricSample>,
    pub thresholds: AlertThresholds,
    pub hourly: &'a [MetricBucket],
    /// Alerts from the last hour
    pub recent_alerts: &'a [AlertEvent],
    pub cache: Option<CacheStats>,
    pub memory: Option<MemoryStats>,
}

/// Generated performance report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub status: SystemStatus,
    pub snapshot: Option<MetricSample>,
    pub trend: Option<Trend>,
    pub alerts: AlertSummary,
    pub cache: Option<CacheStats>,
    pub memory: Option<MemoryStats>,
    pub recommendations: Vec<String>,
}

impl PerformanceReport {
    /// Build a report at `generated_at`
    pub fn build(inputs: ReportInputs<'_>, generated_at: DateTime<Utc>) -> Self {
        let status = inputs
            .snapshot
            .map(|s| SystemStatus::evaluate(s, &inputs.thresholds))
            .unwrap_or(SystemStatus::Healthy);
        let trend = Trend::from_buckets(inputs.hourly);
        let recommendations = recommendations(&inputs, trend.as_ref());

        Self {
            id: Uuid::new_v4(),
            generated_at,
            status,
            snapshot: inputs.snapshot.cloned(),
            trend,
            alerts: AlertSummary::from_events(inputs.recent_alerts),
            cache: inputs.cache,
            memory: inputs.memory,
            recommendations,
        }
    }
}

/// Rule-based advice over exceeded thresholds, alert volume, cache
/// effectiveness and pool saturation
pub fn recommendations(inputs: &ReportInputs<'_>, trend: Option<&Trend>) -> Vec<String> {
    let mut out = Vec::new();
    let t = &inputs.thresholds;

    if let Some(sample) = inputs.snapshot {
        if sample.cpu > t.cpu {
            out.push(format!(
                "CPU usage is {:.1}% (limit {:.0}%); move heavy work off the request path or scale out",
                sample.cpu, t.cpu
            ));
        }
        let ratio = sample.memory.heap_ratio();
        if ratio > t.memory_ratio {
            out.push(format!(
                "Heap usage is {:.0}% of the budget (limit {:.0}%); reduce cache sizes or look for leaks",
                ratio * 100.0,
                t.memory_ratio * 100.0
            ));
        }
        if sample.event_loop_delay > t.event_loop_delay {
            out.push(format!(
                "Runtime scheduling delay is {:.0}ms (limit {:.0}ms); avoid blocking calls in async tasks",
                sample.event_loop_delay, t.event_loop_delay
            ));
        }
        if sample.error_rate > t.error_rate {
            out.push(format!(
                "Error rate is {:.1}% (limit {:.1}%); check recent deployments and dependencies",
                sample.error_rate, t.error_rate
            ));
        }
    }

    if inputs.recent_alerts.len() > ALERT_VOLUME_LIMIT {
        out.push(format!(
            "{} alerts in the last hour; review thresholds or cooldowns",
            inputs.recent_alerts.len()
        ));
    }

    if let Some(trend) = trend {
        if trend.direction == TrendDirection::Degrading {
            out.push(format!(
                "Memory usage is trending up ({:+.1} points); watch for growth in long-lived caches",
                trend.memory_ratio_delta * 100.0
            ));
        }
    }

    if let Some(cache) = &inputs.cache {
        if cache.total_requests >= MIN_CACHE_REQUESTS && cache.hit_rate < LOW_HIT_RATE {
            out.push(format!(
                "Cache hit rate is {:.0}%; increase TTLs or warm frequently read keys",
                cache.hit_rate * 100.0
            ));
        }
    }

    if let Some(memory) = &inputs.memory {
        for pool in memory.pools.iter().filter(|p| p.max_size > 0 && p.size >= p.max_size) {
            out.push(format!(
                "Pool '{}' is saturated at {} objects; consider a larger bound",
                pool.name, pool.max_size
            ));
        }
    }

    if out.is_empty() {
        out.push("System is performing within normal parameters".to_string());
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryUsage;
    use crate::monitor::sample::Granularity;

    fn snapshot(cpu: f64, ratio: f64) -> MetricSample {
        let mut sample = MetricSample::empty(Utc::now());
        sample.cpu = cpu;
        sample.memory = MemoryUsage {
            heap_used: (ratio * 1_000.0) as u64,
            heap_total: 1_000,
            ..Default::default()
        };
        sample
    }

    fn buckets(ratios: &[f64]) -> Vec<MetricBucket> {
        ratios
            .iter()
            .map(|&r| {
                MetricBucket::from_samples(Granularity::Hourly, &[snapshot(10.0, r)]).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_status_levels() {
        let t = AlertThresholds::default();
        assert_eq!(SystemStatus::evaluate(&snapshot(10.0, 0.3), &t), SystemStatus::Healthy);
        assert_eq!(SystemStatus::evaluate(&snapshot(70.0, 0.3), &t), SystemStatus::Warning);
        assert_eq!(SystemStatus::evaluate(&snapshot(10.0, 0.9), &t), SystemStatus::Critical);
    }

    #[test]
    fn test_trend_needs_both_windows() {
        assert!(Trend::from_buckets(&buckets(&[0.5; 11])).is_none());

        let mut ratios = vec![0.40; 6];
        ratios.extend([0.50; 6]);
        let trend = Trend::from_buckets(&buckets(&ratios)).unwrap();
        assert_eq!(trend.direction, TrendDirection::Degrading);
        assert!((trend.memory_ratio_delta - 0.10).abs() < 1e-9);

        let flat = Trend::from_buckets(&buckets(&[0.5; 12])).unwrap();
        assert_eq!(flat.direction, TrendDirection::Stable);
    }

    #[test]
    fn test_trend_uses_latest_windows() {
        // Older history beyond the two windows is ignored
        let mut ratios = vec![0.9; 4];
        ratios.extend([0.6; 6]);
        ratios.extend([0.3; 6]);
        let trend = Trend::from_buckets(&buckets(&ratios)).unwrap();
        assert_eq!(trend.direction, TrendDirection::Improving);
        assert!((trend.prior_memory_ratio - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_quiet_system_recommendation() {
        let sample = snapshot(5.0, 0.2);
        let inputs = ReportInputs {
            snapshot: Some(&sample),
            ..Default::default()
        };
        let report = PerformanceReport::build(inputs, Utc::now());
        assert_eq!(report.status, SystemStatus::Healthy);
        assert_eq!(report.recommendations.len(), 1);
        assert!(report.recommendations[0].contains("normal"));
    }

    #[test]
    fn test_recommendations_cover_breaches() {
        let sample = snapshot(95.0, 0.95);
        let inputs = ReportInputs {
            snapshot: Some(&sample),
            ..Default::default()
        };
        let report = PerformanceReport::build(inputs, Utc::now());
        assert_eq!(report.status, SystemStatus::Critical);
        assert!(report.recommendations.iter().any(|r| r.contains("CPU")));
        assert!(report.recommendations.iter().any(|r| r.contains("Heap")));
    }

    #[test]
    fn test_cache_hit_rate_recommendation() {
        let cache = CacheStats {
            total_requests: 500,
            hit_rate: 0.2,
            ..Default::default()
        };
        let inputs = ReportInputs {
            cache: Some(cache),
            ..Default::default()
        };
        let recs = recommendations(&inputs, None);
        assert!(recs.iter().any(|r| r.contains("hit rate")));
    }
}

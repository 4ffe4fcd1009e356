//! Metric samples and rollup buckets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::MemoryUsage;
use crate::store::{HISTORY_DAILY_KEY, HISTORY_HOURLY_KEY, HISTORY_WEEKLY_KEY};

/// A metric an alert rule can watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricKind {
    /// Process CPU utilisation (percent)
    Cpu,
    /// heapUsed / heapTotal
    MemoryRatio,
    /// Heap bytes in use
    HeapUsed,
    /// Timer overshoot of the runtime (ms)
    EventLoopDelay,
    ActiveHandles,
    ActiveRequests,
    RequestsPerSecond,
    /// Failed requests (percent)
    ErrorRate,
}

impl MetricKind {
    /// Stable name used in logs and exposition
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::MemoryRatio => "memoryRatio",
            MetricKind::HeapUsed => "heapUsed",
            MetricKind::EventLoopDelay => "eventLoopDelay",
            MetricKind::ActiveHandles => "activeHandles",
            MetricKind::ActiveRequests => "activeRequests",
            MetricKind::RequestsPerSecond => "requestsPerSecond",
            MetricKind::ErrorRate => "errorRate",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of process metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    /// CPU percent since the previous sample
    pub cpu: f64,
    pub memory: MemoryUsage,
    /// Milliseconds
    pub event_loop_delay: f64,
    pub active_handles: u64,
    pub active_requests: u64,
    pub requests_per_second: f64,
    /// Percent of requests that failed
    pub error_rate: f64,
}

impl MetricSample {
    /// An all-zero sample taken at `timestamp`
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cpu: 0.0,
            memory: MemoryUsage::default(),
            event_loop_delay: 0.0,
            active_handles: 0,
            active_requests: 0,
            requests_per_second: 0.0,
            error_rate: 0.0,
        }
    }

    /// Read one metric
    pub fn value(&self, metric: MetricKind) -> f64 {
        match metric {
            MetricKind::Cpu => self.cpu,
            MetricKind::MemoryRatio => self.memory.heap_ratio(),
            MetricKind::HeapUsed => self.memory.heap_used as f64,
            MetricKind::EventLoopDelay => self.event_loop_delay,
            MetricKind::ActiveHandles => self.active_handles as f64,
            MetricKind::ActiveRequests => self.active_requests as f64,
            MetricKind::RequestsPerSecond => self.requests_per_second,
            MetricKind::ErrorRate => self.error_rate,
        }
    }
}

// =============================================================================
// Buckets
// =============================================================================

/// Resolution of a bucket series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
    Weekly,
}

impl Granularity {
    /// Store key of the series
    pub fn store_key(&self) -> &'static str {
        match self {
            Granularity::Hourly => HISTORY_HOURLY_KEY,
            Granularity::Daily => HISTORY_DAILY_KEY,
            Granularity::Weekly => HISTORY_WEEKLY_KEY,
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Granularity::Hourly => write!(f, "hourly"),
            Granularity::Daily => write!(f, "daily"),
            Granularity::Weekly => write!(f, "weekly"),
        }
    }
}

/// Average of the samples that fell in `[start, end]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricBucket {
    pub granularity: Granularity,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Number of realtime samples folded into this bucket
    pub sample_count: u64,
    pub cpu: f64,
    pub heap_used: f64,
    pub heap_total: f64,
    pub rss: f64,
    pub external: f64,
    pub memory_ratio: f64,
    pub event_loop_delay: f64,
    pub active_handles: f64,
    pub active_requests: f64,
    pub requests_per_second: f64,
    pub error_rate: f64,
}

impl MetricBucket {
    /// Average realtime samples. `None` for an empty slice.
    pub fn from_samples(granularity: Granularity, samples: &[MetricSample]) -> Option<Self> {
        let singles: Vec<MetricBucket> = samples
            .iter()
            .map(|s| Self::single(granularity, s))
            .collect();
        Self::merge(granularity, &singles)
    }

    fn single(granularity: Granularity, s: &MetricSample) -> Self {
        Self {
            granularity,
            start: s.timestamp,
            end: s.timestamp,
            sample_count: 1,
            cpu: s.cpu,
            heap_used: s.memory.heap_used as f64,
            heap_total: s.memory.heap_total as f64,
            rss: s.memory.rss as f64,
            external: s.memory.external as f64,
            memory_ratio: s.memory.heap_ratio(),
            event_loop_delay: s.event_loop_delay,
            active_handles: s.active_handles as f64,
            active_requests: s.active_requests as f64,
            requests_per_second: s.requests_per_second,
            error_rate: s.error_rate,
        }
    }

    /// Combine buckets into a coarser one, weighting each by its sample
    /// count. `None` for an empty slice.
    pub fn merge(granularity: Granularity, buckets: &[MetricBucket]) -> Option<Self> {
        let first = buckets.first()?;
        let weight: f64 = buckets.iter().map(|b| b.sample_count.max(1) as f64).sum();
        let avg = |field: fn(&MetricBucket) -> f64| {
            buckets
                .iter()
                .map(|b| field(b) * b.sample_count.max(1) as f64)
                .sum::<f64>()
                / weight
        };

        Some(Self {
            granularity,
            start: buckets.iter().map(|b| b.start).min().unwrap_or(first.start),
            end: buckets.iter().map(|b| b.end).max().unwrap_or(first.end),
            sample_count: buckets.iter().map(|b| b.sample_count.max(1)).sum(),
            cpu: avg(|b| b.cpu),
            heap_used: avg(|b| b.heap_used),
            heap_total: avg(|b| b.heap_total),
            rss: avg(|b| b.rss),
            external: avg(|b| b.external),
            memory_ratio: avg(|b| b.memory_ratio),
            event_loop_delay: avg(|b| b.event_loop_delay),
            active_handles: avg(|b| b.active_handles),
            active_requests: avg(|b| b.active_requests),
            requests_per_second: avg(|b| b.requests_per_second),
            error_rate: avg(|b| b.error_rate),
        })
    }

    /// Averaged value of one metric
    pub fn value(&self, metric: MetricKind) -> f64 {
        match metric {
            MetricKind::Cpu => self.cpu,
            MetricKind::MemoryRatio => self.memory_ratio,
            MetricKind::HeapUsed => self.heap_used,
            MetricKind::EventLoopDelay => self.event_loop_delay,
            MetricKind::ActiveHandles => self.active_handles,
            MetricKind::ActiveRequests => self.active_requests,
            MetricKind::RequestsPerSecond => self.requests_per_second,
            MetricKind::ErrorRate => self.error_rate,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(secs: i64, cpu: f64, heap_used: u64) -> MetricSample {
        let mut sample = MetricSample::empty(DateTime::from_timestamp(secs, 0).unwrap());
        sample.cpu = cpu;
        sample.memory = MemoryUsage {
            heap_used,
            heap_total: 1_000,
            rss: heap_used,
            external: 0,
        };
        sample
    }

    #[test]
    fn test_sample_values() {
        let sample = sample_at(0, 42.0, 800);
        assert_eq!(sample.value(MetricKind::Cpu), 42.0);
        assert_eq!(sample.value(MetricKind::HeapUsed), 800.0);
        assert!((sample.value(MetricKind::MemoryRatio) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_bucket_averages_samples() {
        let samples = vec![sample_at(0, 10.0, 200), sample_at(1, 30.0, 400), sample_at(2, 50.0, 600)];
        let bucket = MetricBucket::from_samples(Granularity::Hourly, &samples).unwrap();

        assert_eq!(bucket.sample_count, 3);
        assert!((bucket.cpu - 30.0).abs() < 1e-9);
        assert!((bucket.heap_used - 400.0).abs() < 1e-9);
        assert!((bucket.memory_ratio - 0.4).abs() < 1e-9);
        assert_eq!(bucket.start.timestamp(), 0);
        assert_eq!(bucket.end.timestamp(), 2);
    }

    #[test]
    fn test_merge_weights_by_sample_count() {
        let a = MetricBucket::from_samples(Granularity::Hourly, &vec![sample_at(0, 10.0, 100); 3]).unwrap();
        let b = MetricBucket::from_samples(Granularity::Hourly, &[sample_at(60, 50.0, 100)]).unwrap();

        let daily = MetricBucket::merge(Granularity::Daily, &[a, b]).unwrap();
        assert_eq!(daily.granularity, Granularity::Daily);
        assert_eq!(daily.sample_count, 4);
        // (3 * 10 + 1 * 50) / 4
        assert!((daily.cpu - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(MetricBucket::from_samples(Granularity::Hourly, &[]).is_none());
        assert!(MetricBucket::merge(Granularity::Weekly, &[]).is_none());
    }

    #[test]
    fn test_sample_wire_format() {
        let json = serde_json::to_value(sample_at(0, 1.0, 10)).unwrap();
        assert!(json.get("eventLoopDelay").is_some());
        assert!(json.get("requestsPerSecond").is_some());
        assert!(json["memory"].get("heapUsed").is_some());
    }

    #[test]
    fn test_granularity_keys() {
        assert_eq!(Granularity::Hourly.store_key(), "performance:history:hourly");
        assert_eq!(Granularity::Weekly.to_string(), "weekly");
    }
}

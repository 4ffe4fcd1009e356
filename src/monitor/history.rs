//! Metric History
//!
//! Lossy, constant-space history where resolution degrades with age:
//!
//! ```text
//!  realtime ring (100) ──rollup 60──▶ hourly ──> 1h ──▶ daily ──> 1d ──▶ weekly ──> 4w ──▶ purged
//! ```
//!
//! Local copies serve reads; every change is mirrored to the shared store
//! on a best-effort basis.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::sample::{Granularity, MetricBucket, MetricSample};
use crate::clock::SharedClock;
use crate::store::{codec, StoreClient, REALTIME_KEY};

/// Realtime ring buffer length
pub const REALTIME_CAPACITY: usize = 100;

/// Samples averaged into one hourly bucket
pub const ROLLUP_SAMPLES: usize = 60;

/// Hourly series cap (24h of one-minute buckets)
pub const HOURLY_CAPACITY: usize = 1440;

/// Daily series cap
pub const DAILY_CAPACITY: usize = 1440;

/// Weekly series cap
pub const WEEKLY_CAPACITY: usize = 4096;

/// Outcome of a compaction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionReport {
    /// Hourly buckets folded into a daily entry
    pub hourly_compacted: usize,
    /// Daily buckets folded into a weekly entry
    pub daily_compacted: usize,
    /// Weekly buckets dropped
    pub weekly_purged: usize,
}

#[derive(Debug, Default)]
struct Series {
    hourly: VecDeque<MetricBucket>,
    daily: VecDeque<MetricBucket>,
    weekly: VecDeque<MetricBucket>,
}

impl Series {
    fn get(&self, granularity: Granularity) -> &VecDeque<MetricBucket> {
        match granularity {
            Granularity::Hourly => &self.hourly,
            Granularity::Daily => &self.daily,
            Granularity::Weekly => &self.weekly,
        }
    }

    fn get_mut(&mut self, granularity: Granularity) -> &mut VecDeque<MetricBucket> {
        match granularity {
            Granularity::Hourly => &mut self.hourly,
            Granularity::Daily => &mut self.daily,
            Granularity::Weekly => &mut self.weekly,
        }
    }

    fn append(&mut self, bucket: MetricBucket) {
        let granularity = bucket.granularity;
        let series = self.get_mut(granularity);
        series.push_back(bucket);
        while series.len() > capacity(granularity) {
            series.pop_front();
        }
    }
}

fn capacity(granularity: Granularity) -> usize {
    match granularity {
        Granularity::Hourly => HOURLY_CAPACITY,
        Granularity::Daily => DAILY_CAPACITY,
        Granularity::Weekly => WEEKLY_CAPACITY,
    }
}

/// Remove and return the buckets that ended before `cutoff`
fn take_older(series: &mut VecDeque<MetricBucket>, cutoff: DateTime<Utc>) -> Vec<MetricBucket> {
    let (aged, kept): (Vec<_>, Vec<_>) = series.drain(..).partition(|b| b.end < cutoff);
    series.extend(kept);
    aged
}

/// Realtime samples plus the hourly/daily/weekly bucket series
pub struct MetricsHistory {
    store: Arc<StoreClient>,
    clock: SharedClock,
    realtime_ttl: Duration,
    realtime: Mutex<VecDeque<MetricSample>>,
    pending: Mutex<VecDeque<MetricSample>>,
    series: RwLock<Series>,
}

impl MetricsHistory {
    /// Create an empty history
    pub fn new(store: Arc<StoreClient>, clock: SharedClock, realtime_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            realtime_ttl,
            realtime: Mutex::new(VecDeque::with_capacity(REALTIME_CAPACITY)),
            pending: Mutex::new(VecDeque::with_capacity(REALTIME_CAPACITY)),
            series: RwLock::new(Series::default()),
        }
    }

    /// Append a realtime sample to the ring buffer and the rollup queue
    pub async fn record(&self, sample: MetricSample) {
        let encoded = codec::encode(&sample);
        {
            let mut realtime = self.realtime.lock();
            realtime.push_back(sample.clone());
            while realtime.len() > REALTIME_CAPACITY {
                realtime.pop_front();
            }
        }
        {
            let mut pending = self.pending.lock();
            pending.push_back(sample);
            while pending.len() > REALTIME_CAPACITY {
                pending.pop_front();
            }
        }

        match encoded {
            Ok(bytes) => {
                self.store
                    .push_capped(REALTIME_KEY, bytes, REALTIME_CAPACITY, self.realtime_ttl)
                    .await;
            }
            Err(e) => warn!(error = %e, "Failed to encode realtime sample"),
        }
    }

    /// Average the oldest [`ROLLUP_SAMPLES`] pending samples into one
    /// hourly bucket. Does nothing until enough samples are pending.
    #[instrument(skip(self))]
    pub async fn rollup(&self) -> Option<MetricBucket> {
        let batch: Vec<MetricSample> = {
            let mut pending = self.pending.lock();
            if pending.len() < ROLLUP_SAMPLES {
                return None;
            }
            pending.drain(..ROLLUP_SAMPLES).collect()
        };

        let bucket = MetricBucket::from_samples(Granularity::Hourly, &batch)?;
        self.series.write().append(bucket.clone());
        self.persist(Granularity::Hourly).await;

        debug!(start = %bucket.start, end = %bucket.end, "Hourly bucket rolled up");
        Some(bucket)
    }

    /// Age out buckets: hourly older than 1h become one daily entry, daily
    /// older than 1 day become one weekly entry, weekly older than 4 weeks
    /// are dropped.
    #[instrument(skip(self))]
    pub async fn compact(&self) -> CompactionReport {
        let now = self.clock.now();
        let mut report = CompactionReport::default();
        {
            let mut series = self.series.write();

            let hourly = take_older(&mut series.hourly, now - chrono::Duration::hours(1));
            report.hourly_compacted = hourly.len();
            if let Some(daily) = MetricBucket::merge(Granularity::Daily, &hourly) {
                series.append(daily);
            }

            let daily = take_older(&mut series.daily, now - chrono::Duration::days(1));
            report.daily_compacted = daily.len();
            if let Some(weekly) = MetricBucket::merge(Granularity::Weekly, &daily) {
                series.append(weekly);
            }

            report.weekly_purged = take_older(&mut series.weekly, now - chrono::Duration::weeks(4)).len();
        }

        if report.hourly_compacted > 0 || report.daily_compacted > 0 || report.weekly_purged > 0 {
            self.persist(Granularity::Hourly).await;
            self.persist(Granularity::Daily).await;
            self.persist(Granularity::Weekly).await;
            info!(
                hourly = report.hourly_compacted,
                daily = report.daily_compacted,
                purged = report.weekly_purged,
                "History compacted"
            );
        }
        report
    }

    async fn persist(&self, granularity: Granularity) {
        let snapshot = self.series(granularity);
        match codec::encode(&snapshot) {
            Ok(bytes) => {
                self.store.set(granularity.store_key(), bytes).await;
            }
            Err(e) => warn!(error = %e, %granularity, "Failed to encode history series"),
        }
    }

    /// Load the bucket series persisted by a previous process.
    /// Returns the number of buckets restored.
    pub async fn restore(&self) -> usize {
        let mut restored = 0;
        for granularity in [Granularity::Hourly, Granularity::Daily, Granularity::Weekly] {
            let Some(bytes) = self.store.get(granularity.store_key()).await else {
                continue;
            };
            match codec::decode::<Vec<MetricBucket>>(&bytes) {
                Ok(buckets) => {
                    restored += buckets.len();
                    let mut series = self.series.write();
                    let target = series.get_mut(granularity);
                    target.clear();
                    target.extend(buckets);
                }
                Err(e) => warn!(error = %e, %granularity, "Discarding undecodable history series"),
            }
        }
        restored
    }

    /// Wall clock used for bucketing
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<MetricSample> {
        self.realtime.lock().back().cloned()
    }

    /// Ring buffer contents, oldest first
    pub fn realtime(&self) -> Vec<MetricSample> {
        self.realtime.lock().iter().cloned().collect()
    }

    /// Ring buffer as persisted in the shared store, oldest first
    pub async fn stored_realtime(&self) -> Vec<MetricSample> {
        let mut samples: Vec<MetricSample> = self
            .store
            .range(REALTIME_KEY, 0, -1)
            .await
            .iter()
            .filter_map(|bytes| codec::decode(bytes).ok())
            .collect();
        samples.reverse();
        samples
    }

    /// Samples waiting for the next rollup
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// One bucket series, oldest first
    pub fn series(&self, granularity: Granularity) -> Vec<MetricBucket> {
        self.series.read().get(granularity).iter().cloned().collect()
    }
}

impl std::fmt::Debug for MetricsHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let series = self.series.read();
        f.debug_struct("MetricsHistory")
            .field("realtime", &self.realtime.lock().len())
            .field("pending", &self.pending_len())
            .field("hourly", &series.hourly.len())
            .field("daily", &series.daily.len())
            .field("weekly", &series.weekly.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::memory::MemoryUsage;
    use crate::store::HISTORY_HOURLY_KEY;

    fn history() -> (MetricsHistory, Arc<ManualClock>, Arc<StoreClient>) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(StoreClient::in_memory());
        let history = MetricsHistory::new(store.clone(), clock.clone(), Duration::from_secs(3600));
        (history, clock, store)
    }

    fn sample(clock: &ManualClock, heap_used: u64) -> MetricSample {
        let mut sample = MetricSample::empty(clock.now());
        sample.memory = MemoryUsage {
            heap_used,
            heap_total: 1_000,
            rss: heap_used,
            external: 0,
        };
        sample
    }

    #[tokio::test]
    async fn test_sixty_one_samples_make_one_bucket() {
        let (history, clock, _) = history();

        for _ in 0..61 {
            history.record(sample(&clock, 500)).await;
            clock.advance(Duration::from_secs(60));
            history.rollup().await;
        }

        assert_eq!(history.series(Granularity::Hourly).len(), 1);
        assert_eq!(history.pending_len(), 1);
        assert!(history.realtime().len() <= REALTIME_CAPACITY);
        assert!(history.stored_realtime().await.len() <= REALTIME_CAPACITY);
    }

    #[tokio::test]
    async fn test_ring_buffer_is_capped() {
        let (history, clock, _) = history();

        for i in 0..250 {
            history.record(sample(&clock, i)).await;
            clock.advance(Duration::from_secs(1));
        }

        let local = history.realtime();
        let stored = history.stored_realtime().await;
        assert_eq!(local.len(), REALTIME_CAPACITY);
        assert_eq!(stored.len(), REALTIME_CAPACITY);
        // Newest kept, oldest first
        assert_eq!(local.last().unwrap().memory.heap_used, 249);
        assert_eq!(stored.first().unwrap().memory.heap_used, 150);
        assert_eq!(history.latest().unwrap().memory.heap_used, 249);
    }

    #[tokio::test]
    async fn test_rollup_waits_for_full_batch() {
        let (history, clock, store) = history();
        for _ in 0..59 {
            history.record(sample(&clock, 100)).await;
        }
        assert!(history.rollup().await.is_none());

        history.record(sample(&clock, 100)).await;
        let bucket = history.rollup().await.unwrap();
        assert_eq!(bucket.sample_count, 60);
        assert!(store.exists(HISTORY_HOURLY_KEY).await);
    }

    async fn fill_hourly(history: &MetricsHistory, clock: &ManualClock, buckets: usize) {
        for _ in 0..buckets * ROLLUP_SAMPLES {
            history.record(sample(clock, 400)).await;
            clock.advance(Duration::from_secs(1));
            history.rollup().await;
        }
    }

    #[tokio::test]
    async fn test_compaction_degrades_resolution() {
        let (history, clock, _) = history();
        fill_hourly(&history, &clock, 3).await;
        assert_eq!(history.series(Granularity::Hourly).len(), 3);

        // Nothing is old enough yet
        assert_eq!(history.compact().await, CompactionReport::default());

        clock.advance(Duration::from_secs(2 * 3600));
        let report = history.compact().await;
        assert_eq!(report.hourly_compacted, 3);
        assert!(history.series(Granularity::Hourly).is_empty());
        let daily = history.series(Granularity::Daily);
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].sample_count, 180);

        clock.advance(Duration::from_secs(2 * 86_400));
        let report = history.compact().await;
        assert_eq!(report.daily_compacted, 1);
        assert_eq!(history.series(Granularity::Weekly).len(), 1);

        clock.advance(Duration::from_secs(5 * 7 * 86_400));
        let report = history.compact().await;
        assert_eq!(report.weekly_purged, 1);
        assert!(history.series(Granularity::Weekly).is_empty());
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let (history, clock, store) = history();
        fill_hourly(&history, &clock, 2).await;

        let restarted = MetricsHistory::new(store, clock.clone(), Duration::from_secs(3600));
        assert_eq!(restarted.restore().await, 2);
        assert_eq!(restarted.series(Granularity::Hourly), history.series(Granularity::Hourly));
    }
}

//! Periodic Task Scheduler
//!
//! Runs named periodic jobs on the Tokio runtime as one cancellable group.
//!
//! # Design
//!
//! - Each job gets its own interval loop, so a slow job never delays siblings
//! - Stopping cancels the whole group; a tick already running completes
//! - The scheduler can be paused, and any job can be single-stepped with
//!   [`Scheduler::run_now`] without starting the timers

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type TickFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A named unit of periodic work
pub struct PeriodicJob {
    name: String,
    period: Duration,
    tick: TickFn,
    runs: AtomicU64,
}

impl PeriodicJob {
    /// Create a job that runs `f` every `period`
    pub fn new<F, Fut>(name: impl Into<String>, period: Duration, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            period,
            tick: Arc::new(move || Box::pin(f())),
            runs: AtomicU64::new(0),
        }
    }

    /// Job name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Job period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of completed ticks
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    async fn run(&self) {
        (self.tick)().await;
        self.runs.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for PeriodicJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicJob")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("runs", &self.runs())
            .finish()
    }
}

struct RunningGroup {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Scheduler for a group of periodic jobs
pub struct Scheduler {
    name: String,
    jobs: RwLock<Vec<Arc<PeriodicJob>>>,
    paused: Arc<AtomicBool>,
    running: Mutex<Option<RunningGroup>>,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: RwLock::new(Vec::new()),
            paused: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        }
    }

    /// Register a job. Jobs added while running start with the next `start`.
    pub fn add(&self, job: PeriodicJob) {
        self.jobs.write().push(Arc::new(job));
    }

    /// Names of registered jobs
    pub fn job_names(&self) -> Vec<String> {
        self.jobs.read().iter().map(|j| j.name.clone()).collect()
    }

    /// Completed tick count for a job
    pub fn runs(&self, name: &str) -> Option<u64> {
        self.find(name).map(|j| j.runs())
    }

    fn find(&self, name: &str) -> Option<Arc<PeriodicJob>> {
        self.jobs.read().iter().find(|j| j.name == name).cloned()
    }

    /// Start all job timers. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let jobs = self.jobs.read().clone();
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let token = token.clone();
            let paused = self.paused.clone();
            handles.push(tokio::spawn(async move {
                // First tick fires one full period after start
                let mut ticker = interval_at(Instant::now() + job.period, job.period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if paused.load(Ordering::Relaxed) {
                                continue;
                            }
                            job.run().await;
                        }
                    }
                }
                debug!(job = %job.name, "Periodic job stopped");
            }));
        }

        info!(scheduler = %self.name, jobs = handles.len(), "Scheduler started");
        *running = Some(RunningGroup { token, handles });
        true
    }

    /// Cancel all job timers and wait for in-flight ticks to finish.
    /// Returns false if not running.
    pub async fn stop(&self) -> bool {
        let group = self.running.lock().take();
        let Some(group) = group else {
            return false;
        };

        group.token.cancel();
        for handle in group.handles {
            let _ = handle.await;
        }

        info!(scheduler = %self.name, "Scheduler stopped");
        true
    }

    /// Whether timers are running
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Suspend ticks without cancelling timers
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Resume ticks
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Whether ticks are suspended
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Run one tick of the named job immediately, independent of the timers.
    /// Returns false if no such job exists.
    pub async fn run_now(&self, name: &str) -> bool {
        match self.find(name) {
            Some(job) => {
                job.run().await;
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("jobs", &self.job_names())
            .field("running", &self.is_running())
            .field("paused", &self.is_paused())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_job(name: &str, period: Duration, counter: Arc<AtomicU64>) -> PeriodicJob {
        PeriodicJob::new(name, period, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        })
    }

    #[tokio::test]
    async fn test_run_now_single_steps() {
        let scheduler = Scheduler::new("test");
        let counter = Arc::new(AtomicU64::new(0));
        scheduler.add(counting_job("count", Duration::from_secs(60), counter.clone()));

        assert!(scheduler.run_now("count").await);
        assert!(scheduler.run_now("count").await);
        assert!(!scheduler.run_now("missing").await);

        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert_eq!(scheduler.runs("count"), Some(2));
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_and_stop() {
        let scheduler = Scheduler::new("test");
        let counter = Arc::new(AtomicU64::new(0));
        scheduler.add(counting_job("fast", Duration::from_secs(1), counter.clone()));

        assert!(scheduler.start());
        assert!(!scheduler.start());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 3);

        assert!(scheduler.stop().await);
        assert!(!scheduler.stop().await);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_suppresses_ticks() {
        let scheduler = Scheduler::new("test");
        let counter = Arc::new(AtomicU64::new(0));
        scheduler.add(counting_job("fast", Duration::from_secs(1), counter.clone()));

        scheduler.start();
        scheduler.pause();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        scheduler.resume();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_tick_completes_on_stop() {
        let scheduler = Scheduler::new("test");
        let finished = Arc::new(AtomicU64::new(0));
        let f = finished.clone();
        scheduler.add(PeriodicJob::new("slow", Duration::from_secs(1), move || {
            let f = f.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                f.fetch_add(1, Ordering::Relaxed);
            }
        }));

        scheduler.start();
        // Let the first tick begin
        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.stop().await;

        assert_eq!(finished.load(Ordering::Relaxed), 1);
    }
}

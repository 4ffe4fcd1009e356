//! perfcore Integration Tests
//!
//! End-to-end behaviour across components:
//! - Cache: read-through, invalidation, tag indexes, degraded store
//! - Memory: pool bounds, emergency cleanup isolation
//! - Monitor: cooldowns, rollups, alert pipeline through the dashboard

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use perfcore::memory::ManualMemoryProbe;
use perfcore::monitor::ManualRuntimeStats;
use perfcore::store::InMemoryStore;
use perfcore::StoreClient;

fn shared_store() -> (Arc<StoreClient>, Arc<InMemoryStore>) {
    let backend = Arc::new(InMemoryStore::new());
    let client = Arc::new(StoreClient::new(backend.clone(), Duration::from_millis(100)));
    (client, backend)
}

// =============================================================================
// Cache Engine
// =============================================================================

mod cache_tests {
    use super::*;
    use perfcore::{CacheConfig, CacheEngine, LoadOptions};

    async fn load(engine: &CacheEngine, key: &str, calls: &AtomicUsize, ttl: Duration) -> u64 {
        engine
            .get_or_load(
                key,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::convert::Infallible>(42u64)
                },
                LoadOptions::with_ttl(ttl).l2_ttl(ttl * 10),
            )
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_loader_runs_once_until_both_tiers_expire() {
        let (store, _backend) = shared_store();
        let engine = CacheEngine::new(CacheConfig::default(), store);
        let calls = AtomicUsize::new(0);
        let ttl = Duration::from_secs(30);

        assert_eq!(load(&engine, "course:7", &calls, ttl).await, 42);
        assert_eq!(load(&engine, "course:7", &calls, ttl).await, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // L1 lapses, L2 still serves
        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        load(&engine, "course:7", &calls, ttl).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats(0).l2_hits, 1);

        tokio::time::advance(ttl * 10).await;
        load(&engine, "course:7", &calls, ttl).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_twice_is_harmless() {
        let (store, _backend) = shared_store();
        let engine = CacheEngine::new(CacheConfig::default(), store.clone());
        let calls = AtomicUsize::new(0);

        load(&engine, "user:1", &calls, Duration::from_secs(60)).await;
        engine.invalidate("user:1").await;
        engine.invalidate("user:1").await;

        assert!(!engine.exists("user:1").await);
        assert!(store.get("user:1").await.is_none());

        load(&engine, "user:1", &calls, Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tag_invalidation_removes_every_member() {
        let (store, _backend) = shared_store();
        let engine = CacheEngine::new(CacheConfig::default(), store);
        let ttl = Duration::from_secs(120);

        engine.set_with_tags("lesson:1", &"a", &["course:9"], ttl).await.unwrap();
        engine
            .set_with_tags("lesson:2", &"b", &["course:9", "draft"], ttl)
            .await
            .unwrap();
        engine.set_with_tags("lesson:3", &"c", &["draft"], ttl).await.unwrap();

        assert_eq!(engine.invalidate_by_tag("course:9").await, 2);
        assert!(!engine.exists("lesson:1").await);
        assert!(!engine.exists("lesson:2").await);
        assert!(engine.exists("lesson:3").await);

        assert_eq!(engine.invalidate_by_tag("course:9").await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_to_loader() {
        let (store, backend) = shared_store();
        let engine = CacheEngine::new(CacheConfig::default(), store);
        let calls = AtomicUsize::new(0);
        backend.set_available(false);

        assert_eq!(load(&engine, "k", &calls, Duration::from_secs(60)).await, 42);
        // Still served from L1 while the store is down
        assert_eq!(load(&engine, "k", &calls, Duration::from_secs(60)).await, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.stats(0).l2_failures > 0);
    }

    #[tokio::test]
    async fn test_pattern_invalidation() {
        let (store, _backend) = shared_store();
        let engine = CacheEngine::new(CacheConfig::default(), store);
        let calls = AtomicUsize::new(0);

        for key in ["session:1", "session:2", "profile:1"] {
            load(&engine, key, &calls, Duration::from_secs(60)).await;
        }

        let removed = engine.invalidate_pattern("session:*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(engine.exists("profile:1").await);
        tokio_test::assert_err!(engine.invalidate_pattern("session:[").await);
    }
}

// =============================================================================
// Memory Controller
// =============================================================================

mod memory_tests {
    use super::*;
    use perfcore::{CacheConfig, CacheEngine, Error, MemoryConfig, MemoryController};

    #[tokio::test]
    async fn test_pool_never_exceeds_bound() {
        let controller = MemoryController::new(
            MemoryConfig::default(),
            Arc::new(ManualMemoryProbe::at_ratio(1_000, 0.1)),
        );
        controller.create_pool("rows", Vec::<u32>::new, |v: &mut Vec<u32>| v.clear(), 3);

        let borrowed: Vec<Vec<u32>> = (0..5)
            .map(|_| controller.borrow::<Vec<u32>>("rows").unwrap())
            .collect();
        let kept = borrowed
            .into_iter()
            .filter(|v| controller.release("rows", v.clone()))
            .count();

        assert_eq!(kept, 3);
        let stats = controller.pools().stats();
        assert_eq!(stats[0].size, 3);
        assert!(stats[0].size <= stats[0].max_size);
    }

    #[tokio::test]
    async fn test_emergency_cleanup_isolates_failures() {
        let controller = MemoryController::new(
            MemoryConfig::default(),
            Arc::new(ManualMemoryProbe::at_ratio(1_000, 0.97)),
        );
        let (store, _backend) = shared_store();
        let cache = Arc::new(CacheEngine::new(CacheConfig::default(), store));
        cache.register_cleanup(&controller);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        controller.register_cleanup_task("counts", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        controller.register_cleanup_task("fails", || async {
            Err(Error::Internal("disk gone".into()))
        });
        controller.register_cleanup_task("panics", || async {
            if true {
                panic!("cleanup exploded");
            }
            Ok::<(), Error>(())
        });

        let pool = controller.create_pool("rows", Vec::<u8>::new, |v: &mut Vec<u8>| v.clear(), 20);
        for _ in 0..10 {
            pool.release(Vec::new());
        }

        let report = controller.perform_emergency_cleanup().await;
        assert_eq!(report.tasks_run, 4);
        assert_eq!(report.tasks_failed, 2);
        assert_eq!(report.pool_values_released, 5);
        assert_eq!(pool.size(), 5);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(report.failures.iter().any(|f| f.reason.contains("exploded")));

        // The controller keeps working afterwards
        let report = controller.perform_emergency_cleanup().await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(report.tasks_run, 4);
    }
}

// =============================================================================
// Monitor
// =============================================================================

mod monitor_tests {
    use super::*;
    use perfcore::clock::{Clock, ManualClock};
    use perfcore::monitor::{
        AlertEngine, Comparator, Granularity, MetricKind, MetricSample, MetricsHistory,
    };
    use perfcore::{AlertRule, PerfConfig, PerformanceDashboard, Severity};

    #[test]
    fn test_rule_cooldown_suppresses_repeats() {
        let clock = ManualClock::starting_now();
        let rule = AlertRule::new(MetricKind::Cpu, Comparator::Gt, 80.0)
            .with_cooldown(Duration::from_secs(60));
        let engine = AlertEngine::new(vec![rule], Duration::from_secs(60), clock.clone()).unwrap();

        let mut sample = MetricSample::empty(clock.now());
        sample.cpu = 90.0;

        assert_eq!(engine.evaluate(&sample).len(), 1);
        clock.advance(Duration::from_secs(10));
        assert!(engine.evaluate(&sample).is_empty());
        clock.advance(Duration::from_secs(60));
        assert_eq!(engine.evaluate(&sample).len(), 1);

        let stats = engine.stats();
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.suppressed, 1);
    }

    #[tokio::test]
    async fn test_sixty_one_samples_make_one_hourly_bucket() {
        let clock = ManualClock::starting_now();
        let (store, _backend) = shared_store();
        let history = MetricsHistory::new(store, clock.clone(), Duration::from_secs(300));

        for i in 0..61 {
            let mut sample = MetricSample::empty(clock.now());
            sample.cpu = i as f64;
            history.record(sample).await;
            clock.advance(Duration::from_secs(1));
        }

        let bucket = history.rollup().await.unwrap();
        assert_eq!(bucket.sample_count, 60);
        assert_eq!(bucket.cpu, 29.5);
        assert_eq!(history.series(Granularity::Hourly).len(), 1);
        assert_eq!(history.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_alert_pipeline_end_to_end() {
        let config = PerfConfig {
            rules: vec![
                AlertRule::new(MetricKind::Cpu, Comparator::Gt, 50.0),
                AlertRule::new(MetricKind::ErrorRate, Comparator::Gt, 5.0),
                AlertRule::new(MetricKind::EventLoopDelay, Comparator::Gt, 100.0),
            ],
            ..Default::default()
        };
        let (store, _backend) = shared_store();
        let dashboard = PerformanceDashboard::assemble(
            &config,
            store.clone(),
            Arc::new(ManualMemoryProbe::at_ratio(1_000, 0.3)),
            Arc::new(ManualRuntimeStats::default()),
        )
        .unwrap();
        let mut alerts = dashboard.monitor().subscribe_alerts();

        let mut sample = MetricSample::empty(chrono::Utc::now());
        sample.cpu = 120.0;
        sample.error_rate = 7.0;
        sample.event_loop_delay = 10.0;

        let mut events = dashboard.monitor().ingest(sample).await;
        events.sort_by_key(|e| e.rule.metric.as_str());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].rule.metric, MetricKind::Cpu);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[1].rule.metric, MetricKind::ErrorRate);
        assert_eq!(events[1].severity, Severity::Warning);

        assert!(alerts.recv().await.is_ok());
        assert!(alerts.recv().await.is_ok());

        let window = Duration::from_secs(300);
        assert_eq!(dashboard.recent_alerts(window, None).len(), 2);
        assert_eq!(dashboard.recent_alerts(window, Some(Severity::Critical)).len(), 1);
        assert_eq!(
            store.range(perfcore::store::ALERTS_KEY, 0, -1).await.len(),
            2
        );

        let report = dashboard.report().await;
        assert_eq!(report.alerts.total, 2);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.to_lowercase().contains("cpu")));
    }
}

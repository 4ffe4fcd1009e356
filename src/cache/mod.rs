//! Two-Tier Cache Engine
//!
//! Read-through caching over a process-local L1 and the shared L2 store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          CacheEngine                                     │
//! │   get_or_load · set_with_ttl · set_with_tags · invalidate* · warmup      │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1Cache (in-process)            │  StoreClient → dyn SharedStore (L2)   │
//! │  ┌────────────────────────┐      │  ┌─────────────────────────────────┐  │
//! │  │ DashMap<String, Entry> │      │  │ JSON bytes, store-native TTL    │  │
//! │  │ expiry + hit counters  │      │  │ tag:<t> key lists               │  │
//! │  └────────────────────────┘      │  └─────────────────────────────────┘  │
//! │              │                   │        ▲                              │
//! │              │                   │        │ WriteBehindQueue (bounded)   │
//! │              └───────────── miss → loader → write strategy               │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Read Path
//!
//! 1. L1 hit returns immediately
//! 2. L2 hit backfills L1, then returns
//! 3. Miss runs the caller's loader once and applies the write strategy
//!
//! Concurrent misses on the same key each run their own loader.

mod engine;
mod entry;
mod l1;
mod metrics;
mod strategy;
mod write_behind;

use std::time::Duration;

pub use engine::{CacheConfig, CacheEngine, WarmupFailure, WarmupItem, WarmupReport};
pub use entry::{clamp_ttl, CacheEntry, MAX_TTL, MIN_TTL};
pub use l1::{L1Cache, L1Config, L1Stats};
pub use metrics::{CacheMetrics, CacheStats, HitSource, KeyHits};
pub use strategy::{LoadOptions, Tier, WriteStrategy};
pub use write_behind::{FailureKind, WriteBehindFailure, WriteBehindQueue, WriteBehindStats};

/// Default L1 entry capacity
pub const DEFAULT_L1_MAX_ENTRIES: usize = 10_000;

/// Default L1 TTL (5 minutes)
pub const DEFAULT_L1_TTL: Duration = Duration::from_secs(300);

/// Default L2 TTL (1 hour)
pub const DEFAULT_L2_TTL: Duration = Duration::from_secs(3600);

/// Default write-behind queue depth
pub const DEFAULT_WRITE_BEHIND_CAPACITY: usize = 1024;

// =============================================================================
// Tests
// =============================================================================

//! perfcore - Self-Regulating Performance Core
//!
//! An in-process performance layer for long-running services: a two-tier
//! cache in front of a shared key-value store, a memory-pressure controller
//! with object pools, and a metrics pipeline that samples, alerts, rolls up
//! history and writes reports.
//!
//! # Architecture
//!
//! The components form a feedback loop:
//!
//! ```text
//! PerformanceMonitor (observe) → AlertEngine (decide) → MemoryController (act)
//!                                                          │
//!                                                          ▼
//!                                               CacheEngine cleanup hook
//! ```
//!
//! # Modules
//!
//! - [`cache`] - L1 + shared-store cache with tags, strategies and warmup
//! - [`clock`] - Wall-clock abstraction for timestamps
//! - [`config`] - YAML configuration
//! - [`dashboard`] - Operator facade: queries, admin changes, optimisation
//! - [`error`] - Error types
//! - [`exporter`] - Prometheus exposition
//! - [`memory`] - Pressure levels, pools and emergency cleanup
//! - [`monitor`] - Sampling, alerting, history and reports
//! - [`scheduler`] - Cancellable periodic jobs
//! - [`store`] - Shared store abstraction with degrading client

pub mod cache;
pub mod clock;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod exporter;
pub mod memory;
pub mod monitor;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheEngine, CacheStats, LoadOptions, Tier, WriteStrategy};
pub use clock::{system_clock, Clock, ManualClock, SharedClock};
pub use config::PerfConfig;
pub use dashboard::{OptimizeCategory, PerformanceDashboard};
pub use error::{Error, Result};
pub use exporter::MetricsExporter;
pub use memory::{MemoryConfig, MemoryController, MemoryProbe, PressureLevel};
pub use monitor::{
    AlertEvent, AlertRule, AlertThresholds, PerformanceMonitor, PerformanceReport, Severity,
};
pub use store::{InMemoryStore, SharedStore, StoreClient};

//! Memory Management
//!
//! Pooling and pressure control for the long-running server process.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        MemoryController                                  │
//! │   sample_tick (60s) → pressure level → grow / shrink / emergency         │
//! ├─────────────────────────┬─────────────────────────┬──────────────────────┤
//! │  PoolRegistry           │  Cleanup tasks          │  dyn MemoryProbe     │
//! │  named Pool<T>          │  (cache engine, app     │  ProcessMemoryProbe  │
//! │  buffer:<class> pools   │   callbacks)            │  ManualMemoryProbe   │
//! └─────────────────────────┴─────────────────────────┴──────────────────────┘
//! ```

mod controller;
mod pool;
mod probe;

pub use controller::{
    CleanupFailure, CleanupReport, CleanupTaskId, MemoryConfig, MemoryController, MemoryStats,
    PressureLevel, ResizeReport, GROW_BELOW_RATIO, SAMPLE_JOB,
};
pub use pool::{
    buffer_class, Pool, PoolControl, PoolRegistry, PoolStats, DEFAULT_BUFFER_POOL_SIZE,
    MAX_BUFFER_CLASS, MIN_BUFFER_CLASS,
};
pub use probe::{
    ManualMemoryProbe, MemoryProbe, MemoryUsage, ProcessMemoryProbe, TrackingAllocator,
};

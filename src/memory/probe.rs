//! Process memory probes
//!
//! The controller reads memory through [`MemoryProbe`]. The process probe
//! takes RSS from `/proc/self/statm` and heap usage from the
//! [`TrackingAllocator`] when it is installed as the global allocator.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Page size assumed when converting statm pages to bytes
const PAGE_SIZE: u64 = 4096;

/// One memory reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    /// Bytes currently allocated on the heap
    pub heap_used: u64,
    /// Heap capacity (the configured budget)
    pub heap_total: u64,
    /// Resident set size
    pub rss: u64,
    /// Resident memory not accounted to the heap
    pub external: u64,
}

impl MemoryUsage {
    /// heap_used / heap_total (0 when the total is unknown)
    pub fn heap_ratio(&self) -> f64 {
        if self.heap_total == 0 {
            0.0
        } else {
            self.heap_used as f64 / self.heap_total as f64
        }
    }
}

/// Source of memory readings
pub trait MemoryProbe: Send + Sync {
    /// Take a reading
    fn sample(&self) -> MemoryUsage;
}

// =============================================================================
// Process probe
// =============================================================================

/// Reads the current process
#[derive(Debug, Clone)]
pub struct ProcessMemoryProbe {
    budget: u64,
}

impl ProcessMemoryProbe {
    /// Probe measuring against a heap budget in bytes
    pub fn new(budget: u64) -> Self {
        Self { budget }
    }

    /// Resident set size from `/proc/self/statm`; 0 where unavailable
    pub fn resident_bytes() -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|statm| parse_statm_resident(&statm))
            .map(|pages| pages * PAGE_SIZE)
            .unwrap_or(0)
    }
}

fn parse_statm_resident(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

impl MemoryProbe for ProcessMemoryProbe {
    fn sample(&self) -> MemoryUsage {
        let rss = Self::resident_bytes();
        let tracked = TrackingAllocator::allocated() as u64;
        // Without the tracking allocator installed, RSS is the best heap estimate
        let heap_used = if tracked > 0 { tracked } else { rss };

        MemoryUsage {
            heap_used,
            heap_total: self.budget,
            rss,
            external: rss.saturating_sub(heap_used),
        }
    }
}

// =============================================================================
// Manual probe
// =============================================================================

/// Probe returning whatever was last set (for testing)
#[derive(Debug, Default)]
pub struct ManualMemoryProbe {
    usage: RwLock<MemoryUsage>,
}

impl ManualMemoryProbe {
    /// Create with an initial reading
    pub fn new(usage: MemoryUsage) -> Self {
        Self {
            usage: RwLock::new(usage),
        }
    }

    /// Create at the given heap ratio of `heap_total`
    pub fn at_ratio(heap_total: u64, ratio: f64) -> Self {
        let probe = Self::new(MemoryUsage {
            heap_total,
            ..Default::default()
        });
        probe.set_ratio(ratio);
        probe
    }

    /// Replace the reading
    pub fn set(&self, usage: MemoryUsage) {
        *self.usage.write() = usage;
    }

    /// Set heap_used so the heap ratio equals `ratio`
    pub fn set_ratio(&self, ratio: f64) {
        let mut usage = self.usage.write();
        usage.heap_used = (usage.heap_total as f64 * ratio) as u64;
        usage.rss = usage.heap_used;
    }
}

impl MemoryProbe for ManualMemoryProbe {
    fn sample(&self) -> MemoryUsage {
        *self.usage.read()
    }
}

// =============================================================================
// Tracking allocator
// =============================================================================

static ALLOCATED: AtomicUsize = AtomicUsize::new(0);

/// System allocator wrapper counting live heap bytes.
///
/// Install with `#[global_allocator] static GLOBAL: TrackingAllocator = TrackingAllocator;`
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackingAllocator;

impl TrackingAllocator {
    /// Live heap bytes (0 if not installed)
    pub fn allocated() -> usize {
        ALLOCATED.load(Ordering::Relaxed)
    }
}

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            ALLOCATED.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            ALLOCATED.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        ALLOCATED.fetch_sub(layout.size(), Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            if new_size > layout.size() {
                ALLOCATED.fetch_add(new_size - layout.size(), Ordering::Relaxed);
            } else {
                ALLOCATED.fetch_sub(layout.size() - new_size, Ordering::Relaxed);
            }
        }
        new_ptr
    }
}

// =============================================================================
// Tests
// =============================================================================

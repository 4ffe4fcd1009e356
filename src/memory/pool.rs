//! Object and Buffer Pools
//!
//! Named, bounded free-lists of reusable values. A pool never fails to hand
//! out a value: an empty pool builds a fresh one through its factory, and a
//! release into a full pool drops the value.
//!
//! Buffers are pooled by power-of-two size class; each class is an ordinary
//! `Pool<BytesMut>` registered under `buffer:<class>`.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Smallest pooled buffer class (1 KiB)
pub const MIN_BUFFER_CLASS: usize = 1024;

/// Largest pooled buffer class (16 MiB); bigger requests bypass the pools
pub const MAX_BUFFER_CLASS: usize = 16 * 1024 * 1024;

/// Default bound of an auto-created buffer pool
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 50;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub name: String,
    /// Values currently held
    pub size: usize,
    pub max_size: usize,
    /// Values built by the factory
    pub created: u64,
    /// Borrows served from the free-list
    pub reused: u64,
    /// Releases dropped because the pool was full
    pub discarded: u64,
}

/// Bounded pool of reusable values
pub struct Pool<T> {
    name: String,
    available: Mutex<Vec<T>>,
    max_size: AtomicU64,
    factory: Factory<T>,
    reset: Reset<T>,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl<T: Send + 'static> Pool<T> {
    /// Create an empty pool
    pub fn new<F, R>(name: impl Into<String>, factory: F, reset: R, max_size: usize) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            available: Mutex::new(Vec::with_capacity(max_size.min(64))),
            max_size: AtomicU64::new(max_size as u64),
            factory: Box::new(factory),
            reset: Box::new(reset),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Take a value, building one if the pool is empty
    pub fn borrow(&self) -> T {
        let pooled = self.available.lock().pop();
        match pooled {
            Some(value) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                (self.factory)()
            }
        }
    }

    /// Reset and return a value. Returns false if the pool was full and the
    /// value was dropped.
    pub fn release(&self, mut value: T) -> bool {
        (self.reset)(&mut value);

        let mut available = self.available.lock();
        if available.len() < self.max_size() {
            available.push(value);
            true
        } else {
            drop(available);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

impl<T> Pool<T> {
    /// Pool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Values currently held
    pub fn size(&self) -> usize {
        self.available.lock().len()
    }

    /// Upper bound on held values
    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed) as usize
    }

    /// Change the bound, dropping held values above it
    pub fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size as u64, Ordering::Relaxed);
        self.available.lock().truncate(max_size);
    }

    /// Drop held values down to `len`, returning how many were dropped
    pub fn shrink_to(&self, len: usize) -> usize {
        let mut available = self.available.lock();
        let before = available.len();
        available.truncate(len);
        before - available.len()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            size: self.size(),
            max_size: self.max_size(),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("size", &self.size())
            .field("max_size", &self.max_size())
            .finish()
    }
}

/// Type-erased view of a pool for sizing and reporting
pub trait PoolControl: Send + Sync {
    fn name(&self) -> &str;
    fn size(&self) -> usize;
    fn max_size(&self) -> usize;
    fn set_max_size(&self, max_size: usize);
    fn shrink_to(&self, len: usize) -> usize;
    fn stats(&self) -> PoolStats;
}

impl<T: Send + 'static> PoolControl for Pool<T> {
    fn name(&self) -> &str {
        Pool::name(self)
    }

    fn size(&self) -> usize {
        Pool::size(self)
    }

    fn max_size(&self) -> usize {
        Pool::max_size(self)
    }

    fn set_max_size(&self, max_size: usize) {
        Pool::set_max_size(self, max_size)
    }

    fn shrink_to(&self, len: usize) -> usize {
        Pool::shrink_to(self, len)
    }

    fn stats(&self) -> PoolStats {
        Pool::stats(self)
    }
}

// =============================================================================
// Registry
// =============================================================================

struct RegisteredPool {
    control: Arc<dyn PoolControl>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// Named pools of heterogeneous value types
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<String, RegisteredPool>,
}

impl PoolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a named pool
    pub fn create<T, F, R>(&self, name: &str, factory: F, reset: R, max_size: usize) -> Arc<Pool<T>>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        let pool = Arc::new(Pool::new(name, factory, reset, max_size));
        self.insert(name, Arc::clone(&pool));
        pool
    }

    fn insert<T: Send + 'static>(&self, name: &str, pool: Arc<Pool<T>>) {
        self.pools.insert(
            name.to_string(),
            RegisteredPool {
                control: pool.clone(),
                typed: pool,
            },
        );
    }

    /// Typed handle to a pool; None for an unknown name or a type mismatch
    pub fn get<T: Send + 'static>(&self, name: &str) -> Option<Arc<Pool<T>>> {
        let typed = self.pools.get(name).map(|p| Arc::clone(&p.typed))?;
        typed.downcast::<Pool<T>>().ok()
    }

    /// Typed handle, creating the pool if absent
    pub fn get_or_create<T, F, R>(&self, name: &str, factory: F, reset: R, max_size: usize) -> Option<Arc<Pool<T>>>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        let typed = {
            let entry = self.pools.entry(name.to_string()).or_insert_with(|| {
                let pool = Arc::new(Pool::new(name, factory, reset, max_size));
                RegisteredPool {
                    control: pool.clone(),
                    typed: pool,
                }
            });
            Arc::clone(&entry.typed)
        };
        typed.downcast::<Pool<T>>().ok()
    }

    /// Remove a pool
    pub fn remove(&self, name: &str) -> bool {
        self.pools.remove(name).is_some()
    }

    /// Every registered pool
    pub fn controls(&self) -> Vec<Arc<dyn PoolControl>> {
        self.pools.iter().map(|p| Arc::clone(&p.control)).collect()
    }

    /// Statistics for every pool, sorted by name
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.iter().map(|p| p.control.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Number of pools
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Check if no pools are registered
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.len())
            .finish()
    }
}

// =============================================================================
// Buffer size classes
// =============================================================================

/// Size class serving a request for `size` bytes; None if too large to pool
pub fn buffer_class(size: usize) -> Option<usize> {
    let class = size.max(MIN_BUFFER_CLASS).checked_next_power_of_two()?;
    (class <= MAX_BUFFER_CLASS).then_some(class)
}

/// Size class a buffer of `capacity` can be returned to; None if unpoolable
pub fn release_class(capacity: usize) -> Option<usize> {
    if !(MIN_BUFFER_CLASS..=MAX_BUFFER_CLASS * 2 - 1).contains(&capacity) {
        return None;
    }
    // Largest power of two not above capacity
    let class = 1usize << (usize::BITS - 1 - capacity.leading_zeros());
    Some(class.min(MAX_BUFFER_CLASS))
}

/// Registry name of a buffer class pool
pub fn buffer_pool_name(class: usize) -> String {
    format!("buffer:{}", class)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vec_pool(max: usize) -> Pool<Vec<u8>> {
        Pool::new("vecs", || Vec::with_capacity(16), |v: &mut Vec<u8>| v.clear(), max)
    }

    #[test]
    fn test_empty_pool_builds_through_factory() {
        let pool = vec_pool(4);
        let v = pool.borrow();
        assert!(v.is_empty());
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn test_release_resets_and_reuses() {
        let pool = vec_pool(4);
        let mut v = pool.borrow();
        v.extend_from_slice(b"dirty");
        assert!(pool.release(v));

        let v = pool.borrow();
        assert!(v.is_empty());
        assert_eq!(pool.stats().reused, 1);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_release_beyond_bound_is_dropped() {
        let pool = vec_pool(3);
        for _ in 0..4 {
            pool.release(Vec::new());
        }
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_set_max_size_truncates() {
        let pool = vec_pool(10);
        for _ in 0..10 {
            pool.release(Vec::new());
        }
        pool.set_max_size(4);
        assert_eq!(pool.size(), 4);
        assert_eq!(pool.shrink_to(2), 2);
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_registry_type_mismatch_is_none() {
        let registry = PoolRegistry::new();
        registry.create("strings", String::new, |s: &mut String| s.clear(), 8);

        assert!(registry.get::<String>("strings").is_some());
        assert!(registry.get::<Vec<u8>>("strings").is_none());
        assert!(registry.get::<String>("missing").is_none());
    }

    #[test]
    fn test_registry_stats_sorted() {
        let registry = PoolRegistry::new();
        registry.create("b", String::new, |s: &mut String| s.clear(), 8);
        registry.create("a", Vec::<u8>::new, |v: &mut Vec<u8>| v.clear(), 8);

        let names: Vec<String> = registry.stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.remove("a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_buffer_classes() {
        assert_eq!(buffer_class(1), Some(1024));
        assert_eq!(buffer_class(1024), Some(1024));
        assert_eq!(buffer_class(1025), Some(2048));
        assert_eq!(buffer_class(MAX_BUFFER_CLASS + 1), None);

        assert_eq!(release_class(1024), Some(1024));
        assert_eq!(release_class(3000), Some(2048));
        assert_eq!(release_class(512), None);
        assert_eq!(buffer_pool_name(4096), "buffer:4096");
    }

    proptest! {
        #[test]
        fn prop_pool_never_exceeds_bound(max in 0usize..32, releases in 0usize..100) {
            let pool = vec_pool(max);
            for _ in 0..releases {
                pool.release(Vec::new());
                prop_assert!(pool.size() <= pool.max_size());
            }
            prop_assert_eq!(pool.size(), releases.min(max));
        }

        #[test]
        fn prop_borrowed_buffer_fits_request(size in 1usize..(4 * 1024 * 1024)) {
            let class = buffer_class(size).unwrap();
            prop_assert!(class >= size);
            prop_assert_eq!(release_class(class), Some(class));
        }
    }
}

//! Shared Cache Store
//!
//! Async key/value contract over the remote store shared by every process
//! (the L2 tier), plus the guarded client the rest of the crate talks through.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           StoreClient                                    │
//! │        (bounded timeout per call, transport failure → miss)              │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                      dyn SharedStore (trait)                             │
//! │   get / set_with_ttl / del / exists / keys / push / range / trim / expire│
//! ├───────────────────────────────────┬──────────────────────────────────────┤
//! │  InMemoryStore (single process,   │  External adapters (Redis-like)      │
//! │  tests, fault injection)          │  implemented by collaborators        │
//! └───────────────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! # Persisted Layout
//!
//! - `performance:realtime` - ring buffer of recent samples
//! - `performance:history:{hourly,daily,weekly}` - bucket arrays
//! - `performance:alerts` - bounded alert event list
//! - `performance:latest_report` - most recent report blob
//! - `tag:<tag>` - key list per invalidation tag

mod client;
pub mod codec;
mod memory;
mod pattern;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use client::{StoreClient, StoreHealth};
pub use memory::InMemoryStore;
pub use pattern::KeyPattern;

/// Ring buffer of realtime samples
pub const REALTIME_KEY: &str = "performance:realtime";
/// Hourly bucket series
pub const HISTORY_HOURLY_KEY: &str = "performance:history:hourly";
/// Daily bucket series
pub const HISTORY_DAILY_KEY: &str = "performance:history:daily";
/// Weekly bucket series
pub const HISTORY_WEEKLY_KEY: &str = "performance:history:weekly";
/// Alert event list
pub const ALERTS_KEY: &str = "performance:alerts";
/// Latest generated report
pub const LATEST_REPORT_KEY: &str = "performance:latest_report";
/// Prefix of tag index keys
pub const TAG_PREFIX: &str = "tag:";

/// Store key holding the index for `tag`
pub fn tag_key(tag: &str) -> String {
    format!("{}{}", TAG_PREFIX, tag)
}

/// Contract of the shared key/value store.
///
/// List operations follow Redis index semantics: `push` prepends, and
/// `range`/`trim` take inclusive bounds where negative values count from the
/// tail (`-1` is the last element).
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Get a value
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Set a value without expiry
    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    /// Set a value that expires after `ttl`
    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// List keys matching a glob pattern
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Prepend to a list, returning the new length
    async fn push(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Read an inclusive index range of a list
    async fn range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Bytes>>;

    /// Keep only the inclusive index range of a list
    async fn trim(&self, key: &str, start: isize, stop: isize) -> Result<()>;

    /// Set a key's expiry, returning false if the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Get store statistics
    fn stats(&self) -> StoreStats;
}

/// Shared store statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Live keys
    pub key_count: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

/// Resolve Redis-style inclusive bounds against a list length.
/// Returns `None` when the range selects nothing.
pub(crate) fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = len as isize;
    let norm = |i: isize| if i < 0 { len_i + i } else { i };

    let start = norm(start).max(0);
    let stop = norm(stop).min(len_i - 1);

    if start > stop || start >= len_i {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

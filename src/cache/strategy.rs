//! Write strategies and per-call load options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{DEFAULT_L1_TTL, DEFAULT_L2_TTL};

/// How a freshly loaded value reaches the tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteStrategy {
    /// L1 and L2 written before the call returns
    #[default]
    WriteThrough,
    /// L1 written synchronously, L2 write queued in the background
    WriteBehind,
    /// Both tiers populated for this call only
    CacheAside,
}

impl std::fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteStrategy::WriteThrough => write!(f, "write-through"),
            WriteStrategy::WriteBehind => write!(f, "write-behind"),
            WriteStrategy::CacheAside => write!(f, "cache-aside"),
        }
    }
}

/// Target tier of an explicit write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    L1,
    L2,
    #[default]
    Both,
}

impl Tier {
    /// Whether the write touches L1
    pub fn includes_l1(self) -> bool {
        matches!(self, Tier::L1 | Tier::Both)
    }

    /// Whether the write touches L2
    pub fn includes_l2(self) -> bool {
        matches!(self, Tier::L2 | Tier::Both)
    }
}

/// Options for [`CacheEngine::get_or_load`](super::CacheEngine::get_or_load)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub l1_ttl: Duration,
    pub l2_ttl: Duration,
    pub strategy: WriteStrategy,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            l1_ttl: DEFAULT_L1_TTL,
            l2_ttl: DEFAULT_L2_TTL,
            strategy: WriteStrategy::default(),
        }
    }
}

impl LoadOptions {
    /// Same TTL in both tiers
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            l1_ttl: ttl,
            l2_ttl: ttl,
            ..Default::default()
        }
    }

    pub fn l1_ttl(mut self, ttl: Duration) -> Self {
        self.l1_ttl = ttl;
        self
    }

    pub fn l2_ttl(mut self, ttl: Duration) -> Self {
        self.l2_ttl = ttl;
        self
    }

    pub fn strategy(mut self, strategy: WriteStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

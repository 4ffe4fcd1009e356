//! Configuration
//!
//! [`PerfConfig`] aggregates every component configuration. It loads from an
//! optional YAML file; the binary overlays CLI/environment values on top.
//!
//! ```yaml
//! store:
//!   timeout_ms: 250
//! cache:
//!   default_l1_ttl: 300
//!   l1:
//!     max_entries: 10000
//! memory:
//!   critical_threshold: 0.85
//!   memory_budget_bytes: 1073741824
//! monitor:
//!   realtime_interval: 1
//! thresholds:
//!   cpu: 80
//!   memoryRatio: 0.85
//! ```
//!
//! Durations are whole seconds unless the field name ends in `_ms`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::Result;
use crate::memory::MemoryConfig;
use crate::monitor::{AlertRule, AlertThresholds, MonitorConfig};
use crate::store::StoreClient;

/// Default bound on every shared store call
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Serde adapter for `Duration` as whole seconds
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serde adapter for `Duration` as milliseconds
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Shared store client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Bound on every store call; a timeout counts as a miss
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// Complete configuration of the performance core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerfConfig {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub monitor: MonitorConfig,
    pub thresholds: AlertThresholds,
    /// Explicit alert rules; empty means one rule per threshold
    pub rules: Vec<AlertRule>,
}

impl PerfConfig {
    /// Parse YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: PerfConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout.is_zero() {
            return Err(crate::Error::config("store timeout_ms must be non-zero"));
        }
        self.cache.validate()?;
        self.memory.validate()?;
        self.monitor.validate()?;
        self.thresholds.validate()?;
        self.rules.iter().try_for_each(AlertRule::validate)
    }

    /// Alert rules to start with
    pub fn initial_rules(&self) -> Vec<AlertRule> {
        if self.rules.is_empty() {
            self.thresholds.default_rules()
        } else {
            self.rules.clone()
        }
    }

    /// Store client over the in-process store using the configured timeout
    pub fn in_memory_store(&self) -> StoreClient {
        StoreClient::new(
            std::sync::Arc::new(crate::store::InMemoryStore::new()),
            self.store.timeout,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

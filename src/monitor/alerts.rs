//! Threshold Alerting
//!
//! Rules are evaluated against every realtime sample. A breach emits at most
//! one event per (metric, threshold) cooldown window. Values beyond twice the
//! threshold escalate to **critical** and go through a separate, shorter
//! cooldown keyed by metric only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::sample::{MetricKind, MetricSample};
use crate::clock::SharedClock;
use crate::error::{Error, Result};

/// Cooldown applied when a rule payload omits one
pub const DEFAULT_RULE_COOLDOWN_SECS: u64 = 300;

/// Default cooldown of escalated (critical) events per metric
pub const DEFAULT_CRITICAL_COOLDOWN: Duration = Duration::from_secs(60);

/// Equality tolerance for the `eq` comparator
const EQ_EPSILON: f64 = 1e-9;

/// How an observed value is compared with the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Gt,
    Lt,
    Eq,
}

impl Comparator {
    /// Whether `value` breaches `threshold`
    pub fn breached(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Lt => value < threshold,
            Comparator::Eq => (value - threshold).abs() < EQ_EPSILON,
        }
    }

    /// Whether the breach is severe enough to escalate: twice the threshold
    /// for `gt`, half of it for `lt`. Only positive thresholds escalate, and
    /// equality never does.
    pub fn escalates(&self, value: f64, threshold: f64) -> bool {
        if threshold <= 0.0 {
            return false;
        }
        match self {
            Comparator::Gt => value >= threshold * 2.0,
            Comparator::Lt => value <= threshold / 2.0,
            Comparator::Eq => false,
        }
    }
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Comparator::Gt => write!(f, ">"),
            Comparator::Lt => write!(f, "<"),
            Comparator::Eq => write!(f, "=="),
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

fn default_cooldown() -> u64 {
    DEFAULT_RULE_COOLDOWN_SECS
}

fn default_enabled() -> bool {
    true
}

/// A threshold rule over one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub metric: MetricKind,
    pub threshold: f64,
    pub comparator: Comparator,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl AlertRule {
    /// Enabled rule with the default cooldown
    pub fn new(metric: MetricKind, comparator: Comparator, threshold: f64) -> Self {
        Self {
            metric,
            threshold,
            comparator,
            cooldown_seconds: DEFAULT_RULE_COOLDOWN_SECS,
            enabled: true,
        }
    }

    /// Set the cooldown
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_seconds = cooldown.as_secs();
        self
    }

    /// Set whether the rule is evaluated
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Cooldown window
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    /// Reject non-finite thresholds
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() {
            return Err(Error::config(format!(
                "rule on {} has non-finite threshold",
                self.metric
            )));
        }
        Ok(())
    }

    fn cooldown_key(&self) -> (MetricKind, u64) {
        (self.metric, self.threshold.to_bits())
    }
}

/// An emitted alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub id: Uuid,
    pub rule: AlertRule,
    pub observed_value: f64,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl AlertEvent {
    fn new(rule: &AlertRule, observed_value: f64, severity: Severity, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message: format!(
                "{} {} {} (observed {:.3})",
                rule.metric, rule.comparator, rule.threshold, observed_value
            ),
            rule: rule.clone(),
            observed_value,
            severity,
            timestamp,
        }
    }
}

// =============================================================================
// Thresholds
// =============================================================================

/// Operating limits used for system status and the default rule set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertThresholds {
    /// CPU percent
    pub cpu: f64,
    /// Heap ratio (0, 1]
    pub memory_ratio: f64,
    /// Milliseconds
    pub event_loop_delay: f64,
    /// Percent of failed requests
    pub error_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu: 80.0,
            memory_ratio: 0.85,
            event_loop_delay: 100.0,
            error_rate: 5.0,
        }
    }
}

impl AlertThresholds {
    /// Validate the limits
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("cpu", self.cpu),
            ("memoryRatio", self.memory_ratio),
            ("eventLoopDelay", self.event_loop_delay),
            ("errorRate", self.error_rate),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::config(format!("threshold {} must be positive", name)));
            }
        }
        if self.memory_ratio > 1.0 {
            return Err(Error::config("threshold memoryRatio must be at most 1.0"));
        }
        if self.error_rate > 100.0 {
            return Err(Error::config("threshold errorRate must be at most 100"));
        }
        Ok(())
    }

    /// Limit configured for a metric, if any
    pub fn limit(&self, metric: MetricKind) -> Option<f64> {
        match metric {
            MetricKind::Cpu => Some(self.cpu),
            MetricKind::MemoryRatio => Some(self.memory_ratio),
            MetricKind::EventLoopDelay => Some(self.event_loop_delay),
            MetricKind::ErrorRate => Some(self.error_rate),
            _ => None,
        }
    }

    /// One `gt` rule per limit
    pub fn default_rules(&self) -> Vec<AlertRule> {
        [
            MetricKind::Cpu,
            MetricKind::MemoryRatio,
            MetricKind::EventLoopDelay,
            MetricKind::ErrorRate,
        ]
        .into_iter()
        .filter_map(|metric| {
            self.limit(metric)
                .map(|limit| AlertRule::new(metric, Comparator::Gt, limit))
        })
        .collect()
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Alert engine counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStats {
    pub rules: usize,
    pub evaluations: u64,
    pub emitted: u64,
    pub suppressed: u64,
}

/// Evaluates rules with per-rule and per-metric cooldowns
pub struct AlertEngine {
    rules: RwLock<Arc<Vec<AlertRule>>>,
    clock: SharedClock,
    critical_cooldown: Duration,
    last_sent: DashMap<(MetricKind, u64), DateTime<Utc>>,
    last_critical: DashMap<MetricKind, DateTime<Utc>>,
    evaluations: AtomicU64,
    emitted: AtomicU64,
    suppressed: AtomicU64,
}

impl AlertEngine {
    /// Create an engine. Rules are validated first.
    pub fn new(rules: Vec<AlertRule>, critical_cooldown: Duration, clock: SharedClock) -> Result<Self> {
        validate_rules(&rules)?;
        Ok(Self {
            rules: RwLock::new(Arc::new(rules)),
            clock,
            critical_cooldown,
            last_sent: DashMap::new(),
            last_critical: DashMap::new(),
            evaluations: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        })
    }

    /// Current rule set
    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().as_ref().clone()
    }

    /// Replace the rule set. Nothing changes if any rule is invalid.
    pub fn replace_rules(&self, rules: Vec<AlertRule>) -> Result<()> {
        validate_rules(&rules)?;
        *self.rules.write() = Arc::new(rules);
        Ok(())
    }

    /// Forget all cooldown timestamps
    pub fn reset_cooldowns(&self) {
        self.last_sent.clear();
        self.last_critical.clear();
    }

    /// Evaluate every enabled rule against a sample
    pub fn evaluate(&self, sample: &MetricSample) -> Vec<AlertEvent> {
        let rules = self.rules.read().clone();
        let now = self.clock.now();
        let mut events = Vec::new();

        self.evaluations.fetch_add(1, Ordering::Relaxed);

        for rule in rules.iter().filter(|r| r.enabled) {
            let value = sample.value(rule.metric);
            if !rule.comparator.breached(value, rule.threshold) {
                continue;
            }

            let severity = if rule.comparator.escalates(value, rule.threshold) {
                Severity::Critical
            } else {
                Severity::Warning
            };

            let allowed = match severity {
                Severity::Critical => {
                    cooldown_elapsed(&self.last_critical, rule.metric, now, self.critical_cooldown)
                }
                Severity::Warning => {
                    cooldown_elapsed(&self.last_sent, rule.cooldown_key(), now, rule.cooldown())
                }
            };

            if !allowed {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(metric = %rule.metric, value, %severity, "Alert suppressed by cooldown");
                continue;
            }

            let event = AlertEvent::new(rule, value, severity, now);
            warn!(
                metric = %rule.metric,
                threshold = rule.threshold,
                value,
                %severity,
                "Alert triggered"
            );
            self.emitted.fetch_add(1, Ordering::Relaxed);
            events.push(event);
        }

        events
    }

    /// Get engine statistics
    pub fn stats(&self) -> AlertStats {
        AlertStats {
            rules: self.rules.read().len(),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertEngine")
            .field("critical_cooldown", &self.critical_cooldown)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Check the cooldown for `key` and claim the slot when it has elapsed
fn cooldown_elapsed<K>(
    last: &DashMap<K, DateTime<Utc>>,
    key: K,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> bool
where
    K: std::hash::Hash + Eq,
{
    let window = chrono::Duration::seconds(cooldown.as_secs().min(u32::MAX as u64) as i64);
    match last.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(now);
            true
        }
        Entry::Occupied(mut slot) => {
            if now - *slot.get() >= window {
                slot.insert(now);
                true
            } else {
                false
            }
        }
    }
}

fn validate_rules(rules: &[AlertRule]) -> Result<()> {
    rules.iter().try_for_each(AlertRule::validate)
}

// =============================================================================
// Tests
// =============================================================================

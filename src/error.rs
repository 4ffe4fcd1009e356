//! Error types for the performance core

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the performance core
#[derive(Error, Debug)]
pub enum Error {
    /// Shared store unreachable or returned a failure
    #[error("Shared store transport error: {0}")]
    Transport(String),

    /// Shared store call exceeded its deadline
    #[error("Shared store operation '{operation}' timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Value could not be encoded or decoded at the tier boundary
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed configuration, threshold or rule payload
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Invalid glob pattern for key matching
    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A registered cleanup callback failed during emergency cleanup
    #[error("Cleanup task '{task}' failed: {reason}")]
    CleanupTask { task: String, reason: String },

    /// Background write queue has shut down
    #[error("Write-behind queue closed")]
    QueueClosed,

    /// Metric registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error stems from the shared store being unavailable.
    ///
    /// Transport failures are always recovered locally as misses or no-ops.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout { .. })
    }

    /// Shorthand for a configuration rejection
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

// =============================================================================
// Tests
// =============================================================================

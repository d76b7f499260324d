//! Error types for the tiered cache

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Caller Errors (never retried, never silenced)
    // =========================================================================
    /// Key is empty and cannot be normalized
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    /// Bad argument passed to a cache operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Remote Tier Errors
    // =========================================================================
    /// Remote operation did not complete in time
    #[error("Timeout on {operation} key '{key}' after {}ms", .timeout.as_millis())]
    Timeout {
        operation: String,
        key: String,
        timeout: Duration,
    },

    /// Remote client reported a failure
    #[error("Remote cache error on {operation}: {reason}")]
    Remote { operation: String, reason: String },

    /// Operation did not succeed after all attempts
    #[error("Operation {operation} failed for key '{key}' after {attempts} attempts")]
    OperationFailed {
        operation: String,
        key: String,
        attempts: u32,
    },

    /// Client operation queue is full
    #[error("Remote client operation queue is full")]
    QueueFull,

    /// No cluster topology available
    #[error("Remote cache is not connected: {0}")]
    NotConnected(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML settings parse error
    #[error("Failed to parse settings: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a remote error for an operation
    pub fn remote(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Remote {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, key: impl Into<String>, timeout: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            key: key.into(),
            timeout,
        }
    }

    /// Errors that describe a broken caller contract rather than a tier failure.
    ///
    /// The orchestrator aborts a fan-out on these instead of moving on to the
    /// next tier.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Error::InvalidKey(_) | Error::InvalidArgument(_))
    }
}

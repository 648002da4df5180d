//! Error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure reported while driving an external system.
///
/// Every variant is contained within one reconciliation attempt: it is
/// recorded as a failed outcome and retried on the next trigger.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Certificate authority client failed.
    #[error("issuance failed: {0}")]
    Issuance(String),

    /// Proxy rejected the rendered config (or the template could not be rendered).
    #[error("config validation failed: {0}")]
    Validation(String),

    /// Proxy could not be signalled or did not become ready.
    #[error("activation failed: {0}")]
    Activation(String),

    /// Orchestrator rejected or failed the rolling update.
    #[error("deployment failed: {0}")]
    Deployment(String),

    /// Call exceeded its bound. The effect is unknown; the next attempt re-observes.
    #[error("{operation} timed out after {}s", .after.as_secs_f32())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Action returned success but the expected post-condition does not hold.
    #[error("verification failed: {0}")]
    Verification(String),
}

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Compare-and-swap lost against a concurrent writer.
    #[error("revision conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors loading the desired-state file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Malformed desired spec. Only the offending resource is rejected.
    #[error("invalid {key}: {reason}")]
    Invalid { key: String, reason: String },
}

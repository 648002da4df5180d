//! Reconciliation log entries and the health derived from them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ResourceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Skipped,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Skipped => "skipped",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "skipped" => Ok(Outcome::Skipped),
            "failed" => Ok(Outcome::Failed),
            other => Err(format!("unknown outcome: {}", other)),
        }
    }
}

/// One reconciliation attempt. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub id: Uuid,
    pub resource: ResourceKey,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub error_detail: Option<String>,
    /// Whether the attempt bypassed the circuit breaker.
    pub forced: bool,
    /// `last_applied_revision` after the attempt.
    pub revision: u64,
}

/// Operator-facing health of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResourceHealth {
    /// Never reconciled.
    Unknown,
    Healthy,
    /// Failing, automatic retries continue.
    Failing { consecutive_failures: u32 },
    /// Failing past the breaker threshold; automatic retries are suspended.
    Degraded { consecutive_failures: u32 },
}

impl ResourceHealth {
    pub fn evaluate(last: Option<Outcome>, consecutive_failures: u32, threshold: u32) -> Self {
        match last {
            None => ResourceHealth::Unknown,
            Some(_) if consecutive_failures >= threshold => ResourceHealth::Degraded {
                consecutive_failures,
            },
            Some(_) if consecutive_failures > 0 => ResourceHealth::Failing {
                consecutive_failures,
            },
            Some(_) => ResourceHealth::Healthy,
        }
    }
}

impl fmt::Display for ResourceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceHealth::Unknown => write!(f, "unknown"),
            ResourceHealth::Healthy => write!(f, "healthy"),
            ResourceHealth::Failing {
                consecutive_failures,
            } => write!(f, "failing ({})", consecutive_failures),
            ResourceHealth::Degraded {
                consecutive_failures,
            } => write!(f, "degraded ({})", consecutive_failures),
        }
    }
}

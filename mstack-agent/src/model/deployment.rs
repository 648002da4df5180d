//! Swarm service deployments.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Action, Plan};

/// Container image reference, `repository:tag` optionally pinned `@digest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageReference(String);

impl ImageReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The reference without its digest.
    pub fn repository_tag(&self) -> &str {
        match self.0.split_once('@') {
            Some((name, _)) => name,
            None => &self.0,
        }
    }

    pub fn digest(&self) -> Option<&str> {
        self.0.split_once('@').map(|(_, d)| d)
    }

    /// Whether a running image satisfies this (desired) reference.
    ///
    /// The orchestrator pins images by digest; an unpinned desired reference
    /// matches any digest of the same `repository:tag`.
    pub fn satisfied_by(&self, running: &ImageReference) -> bool {
        if self.digest().is_some() {
            self == running
        } else {
            self.repository_tag() == running.repository_tag()
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageReference {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// State of the most recent rolling update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    InProgress,
    Healthy,
    Failed,
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RolloutStatus::Pending => "pending",
            RolloutStatus::InProgress => "in_progress",
            RolloutStatus::Healthy => "healthy",
            RolloutStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub service_id: String,
    pub image_reference: ImageReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentObserved {
    pub image_reference: ImageReference,
    pub replica_count: u32,
    pub rollout_status: RolloutStatus,
}

pub fn diff(spec: &DeploymentSpec, observed: &DeploymentObserved) -> Plan {
    let image_drift = !spec.image_reference.satisfied_by(&observed.image_reference);
    let replica_drift = spec
        .replica_count
        .is_some_and(|n| n != observed.replica_count);

    if image_drift || replica_drift || observed.rollout_status == RolloutStatus::Failed {
        Plan::Apply(Action::Update {
            image: spec.image_reference.clone(),
            replicas: spec.replica_count,
        })
    } else {
        Plan::NoOp
    }
}

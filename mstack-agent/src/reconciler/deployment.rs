//! Service deployment reconciler - rolls swarm services to the desired image.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Reconciler;
use crate::clients::{bounded, OrchestratorController};
use crate::error::AdapterError;
use crate::model::deployment;
use crate::model::{Action, DeploymentObserved, DeploymentSpec, ObservedState, Plan, RolloutStatus};

pub struct DeploymentReconciler {
    orchestrator: Arc<dyn OrchestratorController>,
    timeout: Duration,
}

impl DeploymentReconciler {
    pub fn new(orchestrator: Arc<dyn OrchestratorController>, timeout: Duration) -> Self {
        Self {
            orchestrator,
            timeout,
        }
    }

    async fn query(&self, service_id: &str) -> Result<DeploymentObserved, AdapterError> {
        let image_reference = bounded(
            "current_image",
            self.timeout,
            self.orchestrator.current_image(service_id),
        )
        .await?;
        let replica_count = bounded(
            "replica_count",
            self.timeout,
            self.orchestrator.replica_count(service_id),
        )
        .await?;
        let rollout_status = bounded(
            "rollout_status",
            self.timeout,
            self.orchestrator.rollout_status(service_id),
        )
        .await?;

        Ok(DeploymentObserved {
            image_reference,
            replica_count,
            rollout_status,
        })
    }
}

#[async_trait]
impl Reconciler for DeploymentReconciler {
    type Spec = DeploymentSpec;
    type Observed = DeploymentObserved;

    fn committed(state: &ObservedState) -> Option<&Self::Observed> {
        state.as_deployment()
    }

    async fn observe(
        &self,
        _id: &str,
        spec: &Self::Spec,
        _last: Option<&Self::Observed>,
    ) -> Result<Self::Observed, AdapterError> {
        self.query(&spec.service_id).await
    }

    fn diff(&self, spec: &Self::Spec, observed: &Self::Observed, _now: DateTime<Utc>) -> Plan {
        deployment::diff(spec, observed)
    }

    async fn apply(
        &self,
        _id: &str,
        spec: &Self::Spec,
        _observed: &Self::Observed,
        action: &Action,
    ) -> Result<(), AdapterError> {
        let Action::Update { image, replicas } = action else {
            return Err(AdapterError::Deployment(format!(
                "unexpected action for deployment: {}",
                action
            )));
        };
        bounded(
            "update_service",
            self.timeout,
            self.orchestrator
                .update_service(&spec.service_id, image, *replicas),
        )
        .await
    }

    async fn verify(
        &self,
        _id: &str,
        spec: &Self::Spec,
        _before: &Self::Observed,
        _action: &Action,
    ) -> Result<Self::Observed, AdapterError> {
        let after = self.query(&spec.service_id).await?;

        if !spec.image_reference.satisfied_by(&after.image_reference) {
            return Err(AdapterError::Verification(format!(
                "{} runs {}, expected {}",
                spec.service_id, after.image_reference, spec.image_reference
            )));
        }
        if after.rollout_status == RolloutStatus::Failed {
            return Err(AdapterError::Verification(format!(
                "rollout of {} failed",
                spec.service_id
            )));
        }
        if let Some(n) = spec.replica_count {
            if after.replica_count != n {
                return Err(AdapterError::Verification(format!(
                    "{} has {} replicas, expected {}",
                    spec.service_id, after.replica_count, n
                )));
            }
        }
        Ok(after)
    }
}

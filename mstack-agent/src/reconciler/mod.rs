//! Reconcilers for the managed resource kinds.
//!
//! Each reconciler observes the external system, diffs it against the
//! desired spec, applies the remediation and verifies the post-condition.
//! [`ReconcileEngine`] runs those phases in order for one resource and turns
//! the result into a committed revision and a reconciliation record.

pub mod certificate;
pub mod deployment;
pub mod proxy;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::clients::{CertificateIssuer, OrchestratorController, ProxyController};
use crate::error::{AdapterError, StoreError, StoreResult};
use crate::model::{
    Action, DesiredSpec, ObservedState, Outcome, Plan, ReconciliationRecord, Resource, ResourceKey,
};
use crate::store::StateStore;

pub use certificate::CertificateReconciler;
pub use deployment::DeploymentReconciler;
pub use proxy::ProxyReconciler;

/// Phase of a single reconciliation attempt.
///
/// Idle is the absence of an in-flight attempt; a failed phase ends the
/// attempt with [`Outcome::Failed`] and a detail prefixed by the phase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Observing,
    Diffing,
    Applying,
    Verifying,
    Committing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Observing => "observing",
            Phase::Diffing => "diffing",
            Phase::Applying => "applying",
            Phase::Verifying => "verifying",
            Phase::Committing => "committing",
        };
        f.write_str(s)
    }
}

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// The desired spec for this kind.
    type Spec: Send + Sync;
    /// The observed snapshot for this kind.
    type Observed: Clone + Send + Sync + Into<ObservedState>;

    /// Extract this kind's snapshot from a committed observed state.
    fn committed(state: &ObservedState) -> Option<&Self::Observed>;

    /// Query the external system. `last` is the last committed snapshot.
    async fn observe(
        &self,
        id: &str,
        spec: &Self::Spec,
        last: Option<&Self::Observed>,
    ) -> Result<Self::Observed, AdapterError>;

    fn diff(&self, spec: &Self::Spec, observed: &Self::Observed, now: DateTime<Utc>) -> Plan;

    async fn apply(
        &self,
        id: &str,
        spec: &Self::Spec,
        observed: &Self::Observed,
        action: &Action,
    ) -> Result<(), AdapterError>;

    /// Re-query and check the action's post-condition, returning the snapshot to commit.
    async fn verify(
        &self,
        id: &str,
        spec: &Self::Spec,
        before: &Self::Observed,
        action: &Action,
    ) -> Result<Self::Observed, AdapterError>;
}

/// External systems the engine drives.
#[derive(Clone)]
pub struct Adapters {
    pub issuer: Arc<dyn CertificateIssuer>,
    pub proxy: Arc<dyn ProxyController>,
    pub orchestrator: Arc<dyn OrchestratorController>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound on every adapter call.
    pub adapter_timeout: Duration,
    /// Issuer contact used when a certificate spec has none.
    pub default_email: Option<String>,
}

/// Result of one attempt, as recorded.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub record: ReconciliationRecord,
    /// Action the attempt planned, whether or not it succeeded.
    pub action: Option<Action>,
}

impl AttemptReport {
    pub fn outcome(&self) -> Outcome {
        self.record.outcome
    }
}

struct Attempt {
    outcome: Outcome,
    detail: Option<String>,
    action: Option<Action>,
    revision: u64,
}

impl Attempt {
    fn skipped(detail: Option<String>, action: Option<Action>, revision: u64) -> Self {
        Self {
            outcome: Outcome::Skipped,
            detail,
            action,
            revision,
        }
    }

    fn failed(phase: Phase, error: AdapterError, action: Option<Action>, revision: u64) -> Self {
        Self {
            outcome: Outcome::Failed,
            detail: Some(format!("{}: {}", phase, error)),
            action,
            revision,
        }
    }
}

pub struct ReconcileEngine {
    store: Arc<StateStore>,
    certificates: CertificateReconciler,
    proxy: ProxyReconciler,
    deployments: DeploymentReconciler,
    audit: Arc<AuditLogger>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ReconcileEngine {
    pub fn new(
        store: Arc<StateStore>,
        adapters: Adapters,
        settings: EngineSettings,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let timeout = settings.adapter_timeout;
        Self {
            store,
            certificates: CertificateReconciler::new(
                adapters.issuer,
                timeout,
                settings.default_email,
            ),
            proxy: ProxyReconciler::new(adapters.proxy, timeout),
            deployments: DeploymentReconciler::new(adapters.orchestrator, timeout),
            audit,
            shutdown: None,
        }
    }

    /// Stop attempts at the next phase boundary once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Run one attempt for `key` and append its record.
    ///
    /// Adapter failures, lost commits and cancellation all end in a record;
    /// only store errors are returned.
    pub async fn reconcile(&self, key: &ResourceKey, forced: bool) -> StoreResult<AttemptReport> {
        let started_at = Utc::now();
        let resource = self.store.load(key).await?;

        let attempt = match &resource.desired {
            DesiredSpec::Certificate(spec) => self.drive(&self.certificates, &resource, spec).await?,
            DesiredSpec::ProxyConfig(spec) => self.drive(&self.proxy, &resource, spec).await?,
            DesiredSpec::ServiceDeployment(spec) => {
                self.drive(&self.deployments, &resource, spec).await?
            }
        };

        let record = ReconciliationRecord {
            id: Uuid::new_v4(),
            resource: key.clone(),
            started_at,
            finished_at: Utc::now(),
            outcome: attempt.outcome,
            error_detail: attempt.detail,
            forced,
            revision: attempt.revision,
        };
        self.store.append_record(&record).await?;

        match (record.outcome, &attempt.action) {
            (Outcome::Success, Some(action)) => {
                info!(resource = %key, revision = record.revision, %action, "Reconciled");
                self.audit.action_applied(key, action, record.revision);
            }
            (Outcome::Failed, _) => {
                let detail = record.error_detail.as_deref().unwrap_or("unknown error");
                warn!(resource = %key, error = detail, "Reconciliation failed");
                self.audit.attempt_failed(key, detail);
            }
            _ => {
                debug!(resource = %key, detail = ?record.error_detail, "Nothing applied");
            }
        }

        Ok(AttemptReport {
            record,
            action: attempt.action,
        })
    }

    fn cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn enter(&self, key: &ResourceKey, phase: Phase) -> Result<(), String> {
        if self.cancelled() {
            return Err(format!("cancelled before {}", phase));
        }
        debug!(resource = %key, %phase, "Entering phase");
        Ok(())
    }

    async fn drive<R: Reconciler>(
        &self,
        reconciler: &R,
        resource: &Resource,
        spec: &R::Spec,
    ) -> StoreResult<Attempt> {
        let key = resource.key();
        let revision = resource.last_applied_revision;
        let last = resource.observed.as_ref().and_then(R::committed);

        if let Err(detail) = self.enter(&key, Phase::Observing) {
            return Ok(Attempt::skipped(Some(detail), None, revision));
        }
        let observed = match reconciler.observe(&resource.id, spec, last).await {
            Ok(observed) => observed,
            Err(e) => return Ok(Attempt::failed(Phase::Observing, e, None, revision)),
        };

        if let Err(detail) = self.enter(&key, Phase::Diffing) {
            return Ok(Attempt::skipped(Some(detail), None, revision));
        }
        let action = match reconciler.diff(spec, &observed, Utc::now()) {
            Plan::NoOp => return Ok(Attempt::skipped(None, None, revision)),
            Plan::Apply(action) => action,
        };

        if let Err(detail) = self.enter(&key, Phase::Applying) {
            return Ok(Attempt::skipped(Some(detail), Some(action), revision));
        }
        info!(resource = %key, %action, "Applying");
        if let Err(e) = reconciler
            .apply(&resource.id, spec, &observed, &action)
            .await
        {
            return Ok(Attempt::failed(Phase::Applying, e, Some(action), revision));
        }

        if let Err(detail) = self.enter(&key, Phase::Verifying) {
            return Ok(Attempt::skipped(Some(detail), Some(action), revision));
        }
        let verified = match reconciler
            .verify(&resource.id, spec, &observed, &action)
            .await
        {
            Ok(verified) => verified,
            Err(e) => return Ok(Attempt::failed(Phase::Verifying, e, Some(action), revision)),
        };

        if let Err(detail) = self.enter(&key, Phase::Committing) {
            return Ok(Attempt::skipped(Some(detail), Some(action), revision));
        }
        let mut updated = resource.clone();
        updated.observed = Some(verified.into());
        match self.store.save(&updated, revision).await {
            Ok(new_revision) => Ok(Attempt {
                outcome: Outcome::Success,
                detail: None,
                action: Some(action),
                revision: new_revision,
            }),
            Err(StoreError::Conflict {
                expected, actual, ..
            }) => {
                self.audit.commit_conflict(&key, expected, actual);
                Ok(Attempt::skipped(
                    Some(format!(
                        "revision conflict: expected {}, found {}",
                        expected, actual
                    )),
                    Some(action),
                    actual,
                ))
            }
            Err(e) => Err(e),
        }
    }
}

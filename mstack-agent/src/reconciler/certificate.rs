//! Certificate reconciler - renews certificates through the issuer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::Reconciler;
use crate::clients::{bounded, CertificateIssuer};
use crate::error::AdapterError;
use crate::model::certificate;
use crate::model::{Action, CertificateObserved, CertificateSpec, ObservedState, Plan};

pub struct CertificateReconciler {
    issuer: Arc<dyn CertificateIssuer>,
    timeout: Duration,
    default_email: Option<String>,
}

impl CertificateReconciler {
    pub fn new(
        issuer: Arc<dyn CertificateIssuer>,
        timeout: Duration,
        default_email: Option<String>,
    ) -> Self {
        Self {
            issuer,
            timeout,
            default_email,
        }
    }

    async fn inspect(&self, domain: &str) -> Result<CertificateObserved, AdapterError> {
        let current = bounded("inspect", self.timeout, self.issuer.inspect(domain)).await?;
        Ok(CertificateObserved { current })
    }
}

#[async_trait]
impl Reconciler for CertificateReconciler {
    type Spec = CertificateSpec;
    type Observed = CertificateObserved;

    fn committed(state: &ObservedState) -> Option<&Self::Observed> {
        state.as_certificate()
    }

    async fn observe(
        &self,
        _id: &str,
        spec: &Self::Spec,
        _last: Option<&Self::Observed>,
    ) -> Result<Self::Observed, AdapterError> {
        self.inspect(&spec.domain).await
    }

    fn diff(&self, spec: &Self::Spec, observed: &Self::Observed, now: DateTime<Utc>) -> Plan {
        certificate::diff(spec, observed, now)
    }

    async fn apply(
        &self,
        _id: &str,
        spec: &Self::Spec,
        _observed: &Self::Observed,
        action: &Action,
    ) -> Result<(), AdapterError> {
        let Action::Renew { domain } = action else {
            return Err(AdapterError::Issuance(format!(
                "unexpected action for certificate: {}",
                action
            )));
        };
        let email = spec
            .email
            .as_deref()
            .or(self.default_email.as_deref())
            .ok_or_else(|| {
                AdapterError::Issuance(format!("no issuer email configured for {}", domain))
            })?;

        let cert = bounded(
            "issue",
            self.timeout,
            self.issuer.issue(domain, email, spec.renewal_window()),
        )
        .await?;
        debug!(%domain, not_after = %cert.not_after, "Issuer returned certificate");
        Ok(())
    }

    async fn verify(
        &self,
        _id: &str,
        spec: &Self::Spec,
        before: &Self::Observed,
        _action: &Action,
    ) -> Result<Self::Observed, AdapterError> {
        let after = self.inspect(&spec.domain).await?;
        let Some(cert) = &after.current else {
            return Err(AdapterError::Verification(format!(
                "no certificate for {} after issuance",
                spec.domain
            )));
        };
        if let Some(previous) = &before.current {
            if cert.not_after <= previous.not_after {
                return Err(AdapterError::Verification(format!(
                    "certificate for {} still expires {}",
                    spec.domain, cert.not_after
                )));
            }
        }
        Ok(after)
    }
}

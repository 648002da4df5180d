//! Proxy config reconciler - renders, validates and activates proxy config.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Reconciler;
use crate::clients::{bounded, ProxyController};
use crate::error::AdapterError;
use crate::model::proxy::{self, config_hash};
use crate::model::{Action, ObservedState, Plan, ProxyObserved, ProxySpec};

pub struct ProxyReconciler {
    controller: Arc<dyn ProxyController>,
    timeout: Duration,
}

impl ProxyReconciler {
    pub fn new(controller: Arc<dyn ProxyController>, timeout: Duration) -> Self {
        Self {
            controller,
            timeout,
        }
    }

    async fn render(&self, spec: &ProxySpec) -> Result<Vec<u8>, AdapterError> {
        let template = tokio::fs::read_to_string(&spec.template_path)
            .await
            .map_err(|e| {
                AdapterError::Validation(format!(
                    "cannot read template {}: {}",
                    spec.template_path.display(),
                    e
                ))
            })?;
        self.controller.render(&template, &spec.template_vars())
    }
}

#[async_trait]
impl Reconciler for ProxyReconciler {
    type Spec = ProxySpec;
    type Observed = ProxyObserved;

    fn committed(state: &ObservedState) -> Option<&Self::Observed> {
        state.as_proxy()
    }

    /// Render the template; the active hash is whatever was last committed.
    async fn observe(
        &self,
        _id: &str,
        spec: &Self::Spec,
        last: Option<&Self::Observed>,
    ) -> Result<Self::Observed, AdapterError> {
        let rendered = self.render(spec).await?;

        Ok(ProxyObserved {
            rendered_config_hash: config_hash(&rendered),
            active_config_hash: last.and_then(|o| o.active_config_hash.clone()),
            rendered,
        })
    }

    fn diff(&self, _spec: &Self::Spec, observed: &Self::Observed, _now: DateTime<Utc>) -> Plan {
        proxy::diff(observed)
    }

    async fn apply(
        &self,
        _id: &str,
        _spec: &Self::Spec,
        observed: &Self::Observed,
        _action: &Action,
    ) -> Result<(), AdapterError> {
        bounded(
            "validate",
            self.timeout,
            self.controller.validate(&observed.rendered),
        )
        .await?;
        bounded(
            "activate",
            self.timeout,
            self.controller.activate(&observed.rendered),
        )
        .await
    }

    /// `activate` only returns once the proxy is ready. The template is
    /// rendered again so a config that moved underneath the reload is not
    /// committed as active.
    async fn verify(
        &self,
        _id: &str,
        spec: &Self::Spec,
        before: &Self::Observed,
        _action: &Action,
    ) -> Result<Self::Observed, AdapterError> {
        let current = config_hash(&self.render(spec).await?);
        if current != before.rendered_config_hash {
            return Err(AdapterError::Verification(format!(
                "rendered config changed during activation: activated {}, now {}",
                before.rendered_config_hash, current
            )));
        }
        Ok(ProxyObserved {
            rendered_config_hash: before.rendered_config_hash.clone(),
            active_config_hash: Some(before.rendered_config_hash.clone()),
            rendered: Vec::new(),
        })
    }
}

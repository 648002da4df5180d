//! Resource model.
//!
//! Each managed resource pairs an externally supplied desired spec with the
//! last observed snapshot of the external system. The per-kind `diff`
//! functions turn that pair into a [`Plan`]; they are pure and never touch
//! adapters or the store.

pub mod certificate;
pub mod deployment;
pub mod proxy;
pub mod record;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use certificate::{Certificate, CertificateObserved, CertificateSpec};
pub use deployment::{DeploymentObserved, DeploymentSpec, ImageReference, RolloutStatus};
pub use proxy::{ProxyObserved, ProxySpec};
pub use record::{Outcome, ReconciliationRecord, ResourceHealth};

/// Kind of a managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Certificate,
    ProxyConfig,
    ServiceDeployment,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Certificate => "certificate",
            ResourceKind::ProxyConfig => "proxy",
            ResourceKind::ServiceDeployment => "deployment",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "certificate" | "cert" => Ok(ResourceKind::Certificate),
            "proxy" | "proxy_config" => Ok(ResourceKind::ProxyConfig),
            "deployment" | "service_deployment" | "service" => Ok(ResourceKind::ServiceDeployment),
            other => Err(format!("unknown resource kind: {}", other)),
        }
    }
}

/// Identity of a resource: `id` is only unique within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl FromStr for ResourceKey {
    type Err = String;

    /// Parses `kind/id`, e.g. `certificate/example.com`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once('/')
            .ok_or_else(|| format!("expected kind/id, got '{}'", s))?;
        if id.is_empty() {
            return Err(format!("empty resource id in '{}'", s));
        }
        Ok(ResourceKey::new(kind.parse()?, id))
    }
}

/// Target description of a resource. Replaced wholesale, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DesiredSpec {
    Certificate(CertificateSpec),
    ProxyConfig(ProxySpec),
    ServiceDeployment(DeploymentSpec),
}

impl DesiredSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            DesiredSpec::Certificate(_) => ResourceKind::Certificate,
            DesiredSpec::ProxyConfig(_) => ResourceKind::ProxyConfig,
            DesiredSpec::ServiceDeployment(_) => ResourceKind::ServiceDeployment,
        }
    }
}

/// Snapshot of the external system, as last committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservedState {
    Certificate(CertificateObserved),
    ProxyConfig(ProxyObserved),
    ServiceDeployment(DeploymentObserved),
}

impl ObservedState {
    pub fn as_certificate(&self) -> Option<&CertificateObserved> {
        match self {
            ObservedState::Certificate(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&ProxyObserved> {
        match self {
            ObservedState::ProxyConfig(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_deployment(&self) -> Option<&DeploymentObserved> {
        match self {
            ObservedState::ServiceDeployment(o) => Some(o),
            _ => None,
        }
    }
}

impl From<CertificateObserved> for ObservedState {
    fn from(o: CertificateObserved) -> Self {
        ObservedState::Certificate(o)
    }
}

impl From<ProxyObserved> for ObservedState {
    fn from(o: ProxyObserved) -> Self {
        ObservedState::ProxyConfig(o)
    }
}

impl From<DeploymentObserved> for ObservedState {
    fn from(o: DeploymentObserved) -> Self {
        ObservedState::ServiceDeployment(o)
    }
}

/// A managed infrastructure unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: String,
    pub desired: DesiredSpec,
    pub observed: Option<ObservedState>,
    pub last_applied_revision: u64,
}

impl Resource {
    pub fn new(id: impl Into<String>, desired: DesiredSpec) -> Self {
        Self {
            id: id.into(),
            desired,
            observed: None,
            last_applied_revision: 0,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.desired.kind()
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind(), self.id.clone())
    }
}

/// Remediation implied by a diff.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Issue or renew the certificate for a domain.
    Renew { domain: String },
    /// Validate and activate a newly rendered proxy config.
    Reload {
        from_hash: Option<String>,
        to_hash: String,
    },
    /// Roll the service to a new image (and optionally replica count).
    Update {
        image: ImageReference,
        replicas: Option<u32>,
    },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Renew { domain } => write!(f, "renew certificate for {}", domain),
            Action::Reload { from_hash, to_hash } => write!(
                f,
                "reload proxy config {} -> {}",
                from_hash.as_deref().map(short_hash).unwrap_or("none"),
                short_hash(to_hash)
            ),
            Action::Update {
                image,
                replicas: Some(n),
            } => write!(f, "update service to {} ({} replicas)", image, n),
            Action::Update {
                image,
                replicas: None,
            } => write!(f, "update service to {}", image),
        }
    }
}

fn short_hash(hash: &str) -> &str {
    &hash[..12.min(hash.len())]
}

/// Result of diffing desired against observed state.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    NoOp,
    Apply(Action),
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        matches!(self, Plan::NoOp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_roundtrip_display() {
        let key: ResourceKey = "certificate/example.com".parse().unwrap();
        assert_eq!(key.kind, ResourceKind::Certificate);
        assert_eq!(key.id, "example.com");
        assert_eq!(key.to_string(), "certificate/example.com");
    }

    #[test]
    fn test_resource_key_accepts_aliases() {
        let key: ResourceKey = "service/app_backend".parse().unwrap();
        assert_eq!(key.kind, ResourceKind::ServiceDeployment);
        assert_eq!(key.to_string(), "deployment/app_backend");
    }

    #[test]
    fn test_resource_key_rejects_bare_id() {
        assert!("example.com".parse::<ResourceKey>().is_err());
        assert!("certificate/".parse::<ResourceKey>().is_err());
        assert!("volume/x".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_desired_spec_json_is_tagged() {
        let spec = DesiredSpec::ServiceDeployment(DeploymentSpec {
            service_id: "app_backend".to_string(),
            image_reference: ImageReference::new("registry.local/backend:1.4.2"),
            replica_count: None,
        });
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["kind"], "service_deployment");
        assert_eq!(json["image_reference"], "registry.local/backend:1.4.2");

        let back: DesiredSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}

//! Desired-state file.
//!
//! ```yaml
//! certificates:
//!   - domain: example.com
//!     email: ops@example.com
//!     renewal_window_days: 30
//! proxy:
//!   template_path: /etc/mstack/nginx.conf.tmpl
//!   targets: [frontend:80, backend:8000]
//! deployments:
//!   - service_id: app_backend
//!     image_reference: registry.local/backend:1.4.2
//! policy:
//!   max_consecutive_failures: 3
//! ```
//!
//! Credentials and endpoints never live here; they come from the
//! environment (see `main.rs`).

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;
use crate::model::proxy::DEFAULT_PROXY_ID;
use crate::model::{
    CertificateSpec, DeploymentSpec, DesiredSpec, ProxySpec, ResourceKey, ResourceKind,
};

fn default_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_jitter_secs() -> u64 {
    60 * 60
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_adapter_timeout_secs() -> u64 {
    300
}

/// Scheduling and failure-handling knobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    #[serde(default = "default_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_jitter_secs")]
    pub jitter_secs: u64,
    /// Consecutive failures that open the circuit breaker.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_adapter_timeout_secs")]
    pub adapter_timeout_secs: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_interval_secs(),
            jitter_secs: default_jitter_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            adapter_timeout_secs: default_adapter_timeout_secs(),
        }
    }
}

impl Policy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_secs(self.jitter_secs)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }
}

/// Raw file layout.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DesiredStateFile {
    #[serde(default)]
    certificates: Vec<CertificateSpec>,
    #[serde(default)]
    proxy: Option<ProxySpec>,
    #[serde(default)]
    deployments: Vec<DeploymentSpec>,
    #[serde(default)]
    policy: Policy,
}

/// Validated desired state.
#[derive(Debug, Default)]
pub struct DesiredState {
    pub resources: Vec<(ResourceKey, DesiredSpec)>,
    /// Resources whose spec failed validation. The rest of the file still applies.
    pub rejected: Vec<(ResourceKey, ConfigError)>,
    pub policy: Policy,
}

impl DesiredState {
    /// Read and validate a desired-state file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        let file: DesiredStateFile = if text.trim().is_empty() {
            DesiredStateFile::default()
        } else {
            serde_yaml::from_str(text)?
        };
        Ok(Self::validate(file))
    }

    fn validate(file: DesiredStateFile) -> Self {
        let mut state = DesiredState {
            policy: file.policy,
            ..Default::default()
        };
        let mut seen = HashSet::new();

        let certificates = file.certificates.into_iter().map(|spec| {
            let key = ResourceKey::new(ResourceKind::Certificate, spec.domain.clone());
            (key, validate_certificate(&spec), DesiredSpec::Certificate(spec))
        });
        let proxy = file.proxy.into_iter().map(|spec| {
            let key = ResourceKey::new(ResourceKind::ProxyConfig, DEFAULT_PROXY_ID);
            (key, validate_proxy(&spec), DesiredSpec::ProxyConfig(spec))
        });
        let deployments = file.deployments.into_iter().map(|spec| {
            let key = ResourceKey::new(ResourceKind::ServiceDeployment, spec.service_id.clone());
            (key, validate_deployment(&spec), DesiredSpec::ServiceDeployment(spec))
        });

        for (key, verdict, spec) in certificates.chain(proxy).chain(deployments) {
            let verdict = verdict.and_then(|()| {
                if seen.insert(key.clone()) {
                    Ok(())
                } else {
                    Err(format!("duplicate {} id '{}'", key.kind, key.id))
                }
            });
            match verdict {
                Ok(()) => state.resources.push((key, spec)),
                Err(reason) => {
                    warn!(resource = %key, %reason, "Rejecting desired spec");
                    let error = ConfigError::Invalid {
                        key: key.to_string(),
                        reason,
                    };
                    state.rejected.push((key, error));
                }
            }
        }

        if state.policy.max_consecutive_failures == 0 {
            warn!("policy.max_consecutive_failures is 0, using 1");
            state.policy.max_consecutive_failures = 1;
        }

        state
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.resources
            .iter()
            .map(|(k, _)| k)
            .chain(self.rejected.iter().map(|(k, _)| k))
    }
}

fn validate_certificate(spec: &CertificateSpec) -> Result<(), String> {
    let domain = spec.domain.as_str();
    if domain.is_empty() {
        return Err("domain must not be empty".to_string());
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(format!("'{}' is not a fully qualified domain", domain));
    }
    if domain
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*'))
    {
        return Err(format!("'{}' contains invalid characters", domain));
    }
    if let Some(email) = &spec.email {
        if !email.contains('@') || email.chars().any(char::is_whitespace) {
            return Err(format!("'{}' is not an email address", email));
        }
    }
    if spec.renewal_window_days == 0 {
        return Err("renewal_window_days must be positive".to_string());
    }
    Ok(())
}

fn validate_proxy(spec: &ProxySpec) -> Result<(), String> {
    if spec.template_path.as_os_str().is_empty() {
        return Err("template_path must not be empty".to_string());
    }
    if let Some(target) = spec.targets.iter().find(|t| t.is_empty() || t.contains(';')) {
        return Err(format!("invalid upstream target '{}'", target));
    }
    Ok(())
}

fn validate_deployment(spec: &DeploymentSpec) -> Result<(), String> {
    if spec.service_id.is_empty() {
        return Err("service_id must not be empty".to_string());
    }
    let image = spec.image_reference.as_str();
    if image.is_empty() || image.chars().any(char::is_whitespace) {
        return Err(format!("'{}' is not an image reference", image));
    }
    Ok(())
}

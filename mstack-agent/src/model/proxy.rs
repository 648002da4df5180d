//! Reverse-proxy configuration rendered from a template.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Action, Plan};

/// Resource id used for the single proxy entry in the desired-state file.
pub const DEFAULT_PROXY_ID: &str = "proxy";

/// Template variable holding one `server <target>;` line per upstream target.
pub const UPSTREAMS_VAR: &str = "upstreams";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySpec {
    pub template_path: PathBuf,
    /// Upstream targets, e.g. `frontend:80`.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Extra template variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
}

impl ProxySpec {
    /// Variables passed to the template renderer.
    pub fn template_vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.vars.clone();
        let upstreams = self
            .targets
            .iter()
            .map(|t| format!("server {};", t))
            .collect::<Vec<_>>()
            .join("\n");
        vars.insert(UPSTREAMS_VAR.to_string(), upstreams);
        vars
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyObserved {
    pub rendered_config_hash: String,
    /// Hash of the config the proxy last reported healthy with.
    pub active_config_hash: Option<String>,
    /// Rendered bytes, only held for the duration of one attempt.
    #[serde(skip)]
    pub rendered: Vec<u8>,
}

/// Hex SHA-256 of a rendered config.
pub fn config_hash(config: &[u8]) -> String {
    format!("{:x}", Sha256::digest(config))
}

pub fn diff(observed: &ProxyObserved) -> Plan {
    if observed.active_config_hash.as_deref() == Some(observed.rendered_config_hash.as_str()) {
        return Plan::NoOp;
    }
    Plan::Apply(Action::Reload {
        from_hash: observed.active_config_hash.clone(),
        to_hash: observed.rendered_config_hash.clone(),
    })
}

//! TLS certificates issued per domain.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{Action, Plan};

pub const DEFAULT_RENEWAL_WINDOW_DAYS: u32 = 30;

fn default_renewal_window_days() -> u32 {
    DEFAULT_RENEWAL_WINDOW_DAYS
}

/// Desired certificate for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSpec {
    pub domain: String,
    /// Contact address for the issuer. Falls back to the agent's configured
    /// issuer email when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_renewal_window_days")]
    pub renewal_window_days: u32,
}

impl CertificateSpec {
    pub fn renewal_window(&self) -> Duration {
        Duration::days(i64::from(self.renewal_window_days))
    }
}

/// An issued certificate as read back from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub domain: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub fingerprint: String,
}

impl Certificate {
    /// True when fewer than `window` remain before expiry.
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.not_after - now < window
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateObserved {
    pub current: Option<Certificate>,
}

pub fn diff(spec: &CertificateSpec, observed: &CertificateObserved, now: DateTime<Utc>) -> Plan {
    match &observed.current {
        Some(cert) if !cert.expires_within(spec.renewal_window(), now) => Plan::NoOp,
        _ => Plan::Apply(Action::Renew {
            domain: spec.domain.clone(),
        }),
    }
}

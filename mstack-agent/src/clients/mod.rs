//! Adapters for the external systems being reconciled.
//!
//! - certbot: certificate issuance and inspection
//! - nginx: proxy config validation and activation
//! - docker swarm: service image updates and rollout status
//!
//! The reconcilers only see the traits below, so tests drive them with fakes.

pub mod certbot;
pub mod nginx;
pub mod swarm;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::AdapterError;
use crate::model::{Certificate, ImageReference, RolloutStatus};

pub use certbot::CertbotIssuer;
pub use nginx::NginxController;
pub use swarm::SwarmController;

#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Issue a certificate, or renew it when less than `renew_before` remains.
    ///
    /// A certificate with more than `renew_before` left is returned unchanged.
    async fn issue(
        &self,
        domain: &str,
        email: &str,
        renew_before: chrono::Duration,
    ) -> Result<Certificate, AdapterError>;

    /// The certificate currently on disk for `domain`, if any.
    async fn inspect(&self, domain: &str) -> Result<Option<Certificate>, AdapterError>;
}

#[async_trait]
pub trait ProxyController: Send + Sync {
    fn render(
        &self,
        template: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, AdapterError> {
        nginx::render_template(template, vars)
    }

    /// Check a candidate config without touching the live one.
    async fn validate(&self, config: &[u8]) -> Result<(), AdapterError>;

    /// Install the config, signal the proxy and wait until it is ready.
    async fn activate(&self, config: &[u8]) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait OrchestratorController: Send + Sync {
    async fn current_image(&self, service_id: &str) -> Result<ImageReference, AdapterError>;

    async fn replica_count(&self, service_id: &str) -> Result<u32, AdapterError>;

    /// Start a rolling update. Returns once the orchestrator accepted it.
    async fn update_service(
        &self,
        service_id: &str,
        image: &ImageReference,
        replicas: Option<u32>,
    ) -> Result<(), AdapterError>;

    async fn rollout_status(&self, service_id: &str) -> Result<RolloutStatus, AdapterError>;
}

/// Run an adapter call with an upper bound on its duration.
pub async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout {
            operation,
            after: limit,
        }),
    }
}

/// Run a command and return its stdout.
///
/// The child is killed if the returned future is dropped, so a timed out
/// call does not leave the tool running.
pub(crate) async fn run_tool(program: &str, args: &[&str]) -> Result<String, String> {
    debug!(program, ?args, "Running");
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to run {}: {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        return Err(if stderr.is_empty() {
            format!("{} exited with {}", program, output.status)
        } else {
            format!("{} exited with {}: {}", program, output.status, stderr)
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

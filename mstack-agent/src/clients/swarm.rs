//! Docker Swarm service management through the docker CLI.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{run_tool, OrchestratorController};
use crate::error::AdapterError;
use crate::model::{ImageReference, RolloutStatus};

const IMAGE_FORMAT: &str = "{{.Spec.TaskTemplate.ContainerSpec.Image}}";
const REPLICAS_FORMAT: &str =
    "{{if .Spec.Mode.Replicated}}{{.Spec.Mode.Replicated.Replicas}}{{else}}0{{end}}";
const UPDATE_STATUS_FORMAT: &str = "{{json .UpdateStatus}}";

pub struct SwarmController {
    docker: String,
}

impl SwarmController {
    /// `docker` is the CLI binary; the daemon is selected through `DOCKER_HOST`.
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }

    async fn inspect(&self, service_id: &str, format: &str) -> Result<String, AdapterError> {
        run_tool(
            &self.docker,
            &["service", "inspect", "--format", format, service_id],
        )
        .await
        .map(|out| out.trim().to_string())
        .map_err(AdapterError::Deployment)
    }
}

#[async_trait]
impl OrchestratorController for SwarmController {
    async fn current_image(&self, service_id: &str) -> Result<ImageReference, AdapterError> {
        let image = self.inspect(service_id, IMAGE_FORMAT).await?;
        if image.is_empty() {
            return Err(AdapterError::Deployment(format!(
                "service {} reports no image",
                service_id
            )));
        }
        Ok(ImageReference::new(image))
    }

    async fn replica_count(&self, service_id: &str) -> Result<u32, AdapterError> {
        let out = self.inspect(service_id, REPLICAS_FORMAT).await?;
        out.parse().map_err(|_| {
            AdapterError::Deployment(format!(
                "unexpected replica count '{}' for {}",
                out, service_id
            ))
        })
    }

    async fn update_service(
        &self,
        service_id: &str,
        image: &ImageReference,
        replicas: Option<u32>,
    ) -> Result<(), AdapterError> {
        let replicas = replicas.map(|n| n.to_string());
        let mut args = vec![
            "service",
            "update",
            "--detach",
            "--with-registry-auth",
            "--image",
            image.as_str(),
        ];
        if let Some(n) = &replicas {
            args.extend(["--replicas", n.as_str()]);
        }
        args.push(service_id);

        info!(service = service_id, image = %image, "Updating service");
        run_tool(&self.docker, &args)
            .await
            .map(|_| ())
            .map_err(AdapterError::Deployment)
    }

    async fn rollout_status(&self, service_id: &str) -> Result<RolloutStatus, AdapterError> {
        let out = self.inspect(service_id, UPDATE_STATUS_FORMAT).await?;
        parse_update_status(&out)
    }
}

#[derive(Debug, Deserialize)]
struct UpdateStatus {
    #[serde(rename = "State", default)]
    state: String,
}

/// Map `docker service inspect`'s `UpdateStatus` JSON to a rollout status.
///
/// A service that was never updated has no `UpdateStatus` at all.
pub fn parse_update_status(json: &str) -> Result<RolloutStatus, AdapterError> {
    let json = json.trim();
    if json.is_empty() || json == "null" {
        return Ok(RolloutStatus::Healthy);
    }

    let status: UpdateStatus = serde_json::from_str(json)
        .map_err(|e| AdapterError::Deployment(format!("bad UpdateStatus '{}': {}", json, e)))?;

    Ok(match status.state.as_str() {
        "updating" | "rollback_started" => RolloutStatus::InProgress,
        "completed" => RolloutStatus::Healthy,
        "paused" | "rollback_paused" | "rollback_completed" => RolloutStatus::Failed,
        _ => RolloutStatus::Pending,
    })
}

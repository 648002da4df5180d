//! nginx config validation and activation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{run_tool, ProxyController};
use crate::error::AdapterError;

const DEFAULT_RELOAD_COMMAND: &str = "nginx -s reload";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Substitute `{{ name }}` placeholders.
///
/// Unknown names and unterminated placeholders are validation errors, so a
/// typo in the template never reaches the proxy.
pub fn render_template(
    template: &str,
    vars: &BTreeMap<String, String>,
) -> Result<Vec<u8>, AdapterError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            AdapterError::Validation("unterminated '{{' in proxy template".to_string())
        })?;
        let name = after[..end].trim();
        let value = vars.get(name).ok_or_else(|| {
            AdapterError::Validation(format!("undefined template variable '{}'", name))
        })?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(out.into_bytes())
}

pub struct NginxController {
    binary: String,
    config_path: PathBuf,
    reload_command: Vec<String>,
    health_url: Option<String>,
    ready_timeout: Duration,
    http: reqwest::Client,
}

impl NginxController {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            binary: "nginx".to_string(),
            config_path,
            reload_command: split_command(DEFAULT_RELOAD_COMMAND),
            health_url: None,
            ready_timeout: Duration::from_secs(30),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Whitespace-separated command run after the new config is in place.
    pub fn with_reload_command(mut self, command: &str) -> Self {
        let parts = split_command(command);
        if !parts.is_empty() {
            self.reload_command = parts;
        }
        self
    }

    pub fn with_health_url(mut self, url: Option<String>) -> Self {
        self.health_url = url;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.config_path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    async fn write_candidate(&self, config: &[u8]) -> Result<PathBuf, String> {
        let candidate = self.sibling(".candidate");
        tokio::fs::write(&candidate, config)
            .await
            .map_err(|e| format!("cannot write {}: {}", candidate.display(), e))?;
        Ok(candidate)
    }

    async fn reload(&self) -> Result<(), String> {
        let (program, args) = self
            .reload_command
            .split_first()
            .ok_or_else(|| "empty reload command".to_string())?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_tool(program, &args).await.map(|_| ())
    }

    async fn wait_ready(&self) -> Result<(), String> {
        let Some(url) = &self.health_url else {
            return Ok(());
        };

        let deadline = Instant::now() + self.ready_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(format!(
                    "{} not ready after {}s",
                    url,
                    self.ready_timeout.as_secs()
                ));
            }
            let last_error = match self.http.get(url).timeout(remaining).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => format!("status {}", resp.status()),
                Err(e) => e.to_string(),
            };
            if Instant::now() + READY_POLL_INTERVAL > deadline {
                return Err(format!(
                    "{} not ready after {}s: {}",
                    url,
                    self.ready_timeout.as_secs(),
                    last_error
                ));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Put the previous config back and reload it.
    async fn rollback(&self, backup: Option<&Path>) {
        let restored = match backup {
            Some(backup) => tokio::fs::rename(backup, &self.config_path).await,
            None => tokio::fs::remove_file(&self.config_path).await,
        };
        if let Err(e) = restored {
            warn!(path = %self.config_path.display(), error = %e, "Failed to restore previous proxy config");
            return;
        }
        if let Err(e) = self.reload().await {
            warn!(error = %e, "Reload after rollback failed");
        }
    }
}

#[async_trait]
impl ProxyController for NginxController {
    async fn validate(&self, config: &[u8]) -> Result<(), AdapterError> {
        let candidate = self
            .write_candidate(config)
            .await
            .map_err(AdapterError::Validation)?;
        let candidate_str = candidate.to_string_lossy();

        let result = run_tool(&self.binary, &["-t", "-q", "-c", candidate_str.as_ref()]).await;
        if let Err(e) = tokio::fs::remove_file(&candidate).await {
            debug!(path = %candidate.display(), error = %e, "Failed to remove candidate config");
        }
        result.map(|_| ()).map_err(AdapterError::Validation)
    }

    async fn activate(&self, config: &[u8]) -> Result<(), AdapterError> {
        let candidate = self
            .write_candidate(config)
            .await
            .map_err(AdapterError::Activation)?;

        let backup = if tokio::fs::try_exists(&self.config_path)
            .await
            .unwrap_or(false)
        {
            let backup = self.sibling(".previous");
            tokio::fs::copy(&self.config_path, &backup)
                .await
                .map_err(|e| AdapterError::Activation(format!("cannot back up config: {}", e)))?;
            Some(backup)
        } else {
            None
        };

        tokio::fs::rename(&candidate, &self.config_path)
            .await
            .map_err(|e| {
                AdapterError::Activation(format!(
                    "cannot install {}: {}",
                    self.config_path.display(),
                    e
                ))
            })?;

        let activated = match self.reload().await {
            Ok(()) => self.wait_ready().await,
            Err(e) => Err(format!("reload failed: {}", e)),
        };

        match activated {
            Ok(()) => {
                info!(path = %self.config_path.display(), "Proxy config activated");
                if let Some(backup) = backup {
                    if let Err(e) = tokio::fs::remove_file(&backup).await {
                        debug!(path = %backup.display(), error = %e, "Failed to remove previous config");
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Activation failed, rolling back");
                self.rollback(backup.as_deref()).await;
                Err(AdapterError::Activation(e))
            }
        }
    }
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

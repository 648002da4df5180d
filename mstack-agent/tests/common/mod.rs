//! Test helpers for mstack-agent integration tests.
//!
//! The fakes stand in for certbot, nginx and docker. They keep a log of the
//! calls made to them and can be told to fail, hang or block on a gate.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::{watch, Notify};

use mstack_agent::audit::{create_audit_logger, AuditLogger};
use mstack_agent::clients::{CertificateIssuer, OrchestratorController, ProxyController};
use mstack_agent::config::{DesiredState, Policy};
use mstack_agent::error::AdapterError;
use mstack_agent::model::proxy::config_hash;
use mstack_agent::model::{Certificate, ImageReference, ResourceKey, RolloutStatus};
use mstack_agent::reconciler::{Adapters, EngineSettings, ReconcileEngine};
use mstack_agent::scheduler::{Scheduler, SchedulerChannels};
use mstack_agent::store::StateStore;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

// === Certificate issuer ===

#[derive(Default)]
pub struct FakeIssuer {
    certs: Mutex<HashMap<String, Certificate>>,
    failing: Mutex<bool>,
    issue_calls: Mutex<usize>,
    gate: Mutex<Option<Arc<Notify>>>,
    /// Notified when `issue` is entered.
    pub entered: Arc<Notify>,
}

impl FakeIssuer {
    /// Put a certificate on "disk" with `days_left` until expiry.
    pub fn with_certificate(&self, domain: &str, days_left: i64) {
        let now = Utc::now();
        lock(&self.certs).insert(
            domain.to_string(),
            Certificate {
                domain: domain.to_string(),
                issuer: "CN = Fake CA".to_string(),
                not_before: now - chrono::Duration::days(60),
                not_after: now + chrono::Duration::days(days_left),
                fingerprint: "00:11:22".to_string(),
            },
        );
    }

    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    pub fn issue_calls(&self) -> usize {
        *lock(&self.issue_calls)
    }

    /// Make `issue` block until the returned gate is notified.
    pub fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.gate) = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl CertificateIssuer for FakeIssuer {
    async fn issue(
        &self,
        domain: &str,
        _email: &str,
        renew_before: chrono::Duration,
    ) -> Result<Certificate, AdapterError> {
        *lock(&self.issue_calls) += 1;
        self.entered.notify_one();

        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if *lock(&self.failing) {
            return Err(AdapterError::Issuance("acme: rate limited".to_string()));
        }

        let mut certs = lock(&self.certs);
        let now = Utc::now();
        if let Some(existing) = certs.get(domain) {
            if !existing.expires_within(renew_before, now) {
                return Ok(existing.clone());
            }
        }
        let cert = Certificate {
            domain: domain.to_string(),
            issuer: "CN = Fake CA".to_string(),
            not_before: now,
            not_after: now + chrono::Duration::days(90),
            fingerprint: format!("fp-{}", now.timestamp_nanos_opt().unwrap_or_default()),
        };
        certs.insert(domain.to_string(), cert.clone());
        Ok(cert)
    }

    async fn inspect(&self, domain: &str) -> Result<Option<Certificate>, AdapterError> {
        Ok(lock(&self.certs).get(domain).cloned())
    }
}

// === Proxy ===

#[derive(Default)]
pub struct FakeProxy {
    calls: Mutex<Vec<String>>,
    fail_validate: Mutex<bool>,
    fail_activate: Mutex<bool>,
    /// Template overwritten while `activate` runs.
    rewrite_on_activate: Mutex<Option<(PathBuf, String)>>,
}

impl FakeProxy {
    /// Calls as `validate:<hash>` / `activate:<hash>`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| c.split(':').next().unwrap_or_default().to_string())
            .collect()
    }

    pub fn set_fail_validate(&self, fail: bool) {
        *lock(&self.fail_validate) = fail;
    }

    pub fn set_fail_activate(&self, fail: bool) {
        *lock(&self.fail_activate) = fail;
    }

    /// Have the next `activate` replace the template at `path` with `content`.
    pub fn rewrite_template_on_activate(&self, path: PathBuf, content: &str) {
        *lock(&self.rewrite_on_activate) = Some((path, content.to_string()));
    }
}

#[async_trait]
impl ProxyController for FakeProxy {
    async fn validate(&self, config: &[u8]) -> Result<(), AdapterError> {
        lock(&self.calls).push(format!("validate:{}", config_hash(config)));
        if *lock(&self.fail_validate) {
            return Err(AdapterError::Validation("unknown directive".to_string()));
        }
        Ok(())
    }

    async fn activate(&self, config: &[u8]) -> Result<(), AdapterError> {
        lock(&self.calls).push(format!("activate:{}", config_hash(config)));
        let rewrite = lock(&self.rewrite_on_activate).take();
        if let Some((path, content)) = rewrite {
            std::fs::write(path, content).unwrap();
        }
        if *lock(&self.fail_activate) {
            return Err(AdapterError::Activation("proxy not ready".to_string()));
        }
        Ok(())
    }
}

// === Orchestrator ===

#[derive(Debug, Clone)]
pub struct FakeService {
    pub image: ImageReference,
    pub replicas: u32,
    pub status: RolloutStatus,
}

#[derive(Default)]
pub struct FakeOrchestrator {
    services: Mutex<HashMap<String, FakeService>>,
    update_calls: Mutex<Vec<(String, ImageReference, Option<u32>)>>,
    /// Rollout status a service reports after an update.
    status_after_update: Mutex<Option<RolloutStatus>>,
    hang_updates: Mutex<bool>,
}

impl FakeOrchestrator {
    pub fn with_service(&self, service_id: &str, image: &str, replicas: u32) {
        lock(&self.services).insert(
            service_id.to_string(),
            FakeService {
                image: ImageReference::new(image),
                replicas,
                status: RolloutStatus::Healthy,
            },
        );
    }

    pub fn service(&self, service_id: &str) -> Option<FakeService> {
        lock(&self.services).get(service_id).cloned()
    }

    pub fn update_calls(&self) -> Vec<(String, ImageReference, Option<u32>)> {
        lock(&self.update_calls).clone()
    }

    pub fn set_status_after_update(&self, status: RolloutStatus) {
        *lock(&self.status_after_update) = Some(status);
    }

    pub fn set_hang_updates(&self, hang: bool) {
        *lock(&self.hang_updates) = hang;
    }

    fn get(&self, service_id: &str) -> Result<FakeService, AdapterError> {
        self.service(service_id)
            .ok_or_else(|| AdapterError::Deployment(format!("no such service: {}", service_id)))
    }
}

#[async_trait]
impl OrchestratorController for FakeOrchestrator {
    async fn current_image(&self, service_id: &str) -> Result<ImageReference, AdapterError> {
        Ok(self.get(service_id)?.image)
    }

    async fn replica_count(&self, service_id: &str) -> Result<u32, AdapterError> {
        Ok(self.get(service_id)?.replicas)
    }

    async fn update_service(
        &self,
        service_id: &str,
        image: &ImageReference,
        replicas: Option<u32>,
    ) -> Result<(), AdapterError> {
        lock(&self.update_calls).push((service_id.to_string(), image.clone(), replicas));
        let hang = *lock(&self.hang_updates);
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let status = lock(&self.status_after_update).unwrap_or(RolloutStatus::Healthy);
        let mut services = lock(&self.services);
        let service = services
            .get_mut(service_id)
            .ok_or_else(|| AdapterError::Deployment(format!("no such service: {}", service_id)))?;
        service.image = image.clone();
        if let Some(n) = replicas {
            service.replicas = n;
        }
        service.status = status;
        Ok(())
    }

    async fn rollout_status(&self, service_id: &str) -> Result<RolloutStatus, AdapterError> {
        Ok(self.get(service_id)?.status)
    }
}

// === Harness ===

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<StateStore>,
    pub issuer: Arc<FakeIssuer>,
    pub proxy: Arc<FakeProxy>,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub audit: Arc<AuditLogger>,
    pub engine: Arc<ReconcileEngine>,
}

pub struct HarnessOptions {
    pub adapter_timeout: Duration,
    pub default_email: Option<String>,
    pub shutdown: Option<watch::Receiver<bool>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(5),
            default_email: Some("ops@example.com".to_string()),
            shutdown: None,
        }
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    pub async fn with_options(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).await.unwrap());
        let issuer = Arc::new(FakeIssuer::default());
        let proxy = Arc::new(FakeProxy::default());
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let audit = create_audit_logger("test");

        let adapters = Adapters {
            issuer: issuer.clone(),
            proxy: proxy.clone(),
            orchestrator: orchestrator.clone(),
        };
        let settings = EngineSettings {
            adapter_timeout: options.adapter_timeout,
            default_email: options.default_email,
        };
        let mut engine = ReconcileEngine::new(Arc::clone(&store), adapters, settings, audit.clone());
        if let Some(shutdown) = options.shutdown {
            engine = engine.with_shutdown(shutdown);
        }

        Self {
            dir,
            store,
            issuer,
            proxy,
            orchestrator,
            audit,
            engine: Arc::new(engine),
        }
    }

    /// Load a desired-state document into the store.
    pub async fn apply_config(&self, yaml: &str) -> DesiredState {
        let state = DesiredState::from_yaml(yaml).unwrap();
        self.store.sync(&state).await.unwrap();
        state
    }

    /// Write a proxy template into the temp dir and return its path.
    pub fn write_template(&self, content: &str) -> PathBuf {
        let path = self.dir.path().join("nginx.conf.tmpl");
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Register a proxy config rendering `content`.
    pub async fn proxy_with_template(&self, content: &str) -> ResourceKey {
        let path = self.write_template(content);
        self.apply_config(&format!(
            "proxy:\n  template_path: {}\n  targets: [frontend:80, backend:8000]\n",
            path.display()
        ))
        .await;
        "proxy/proxy".parse().unwrap()
    }

    pub fn scheduler(&self, policy: Policy) -> (Arc<Scheduler>, SchedulerChannels) {
        Scheduler::new(Arc::clone(&self.engine), policy, Arc::clone(&self.audit))
    }
}

pub fn key(s: &str) -> ResourceKey {
    s.parse().unwrap()
}

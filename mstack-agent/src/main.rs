//! mstack-agent: reconciliation agent for a single-host container stack.
//!
//! Keeps three kinds of infrastructure converged on their desired state:
//! - TLS certificates (certbot)
//! - Reverse-proxy config (nginx)
//! - Swarm service images (docker)
//!
//! `run` starts the scheduler as a daemon; the other subcommands are one-shot
//! operator commands against the same state store.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tabled::{Table, Tabled};
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mstack_agent::audit::{create_audit_logger, AuditLogger};
use mstack_agent::clients::{CertbotIssuer, NginxController, SwarmController};
use mstack_agent::config::{DesiredState, Policy};
use mstack_agent::error::StoreError;
use mstack_agent::model::{ObservedState, Outcome, ReconciliationRecord, ResourceKey};
use mstack_agent::reconciler::{Adapters, AttemptReport, EngineSettings, ReconcileEngine};
use mstack_agent::scheduler::{Dispatch, Scheduler, SchedulerChannels, TriggerSource};
use mstack_agent::store::StateStore;

const EXIT_OK: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_NOT_FOUND: u8 = 2;

/// mstack reconciliation agent
#[derive(Parser, Debug)]
#[command(name = "mstack-agent", version, about)]
struct Cli {
    /// Desired-state file
    #[arg(long, env = "MSTACK_CONFIG", default_value = "/etc/mstack/desired.yaml", global = true)]
    config: PathBuf,

    /// Directory holding the state database
    #[arg(long, env = "MSTACK_DATA_DIR", default_value = "/var/lib/mstack", global = true)]
    data_dir: PathBuf,

    #[command(flatten)]
    adapters: AdapterArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Endpoints and credentials of the external tools.
#[derive(Args, Debug)]
struct AdapterArgs {
    /// Issuer contact for certificates that do not name one
    #[arg(long, env = "MSTACK_ISSUER_EMAIL", global = true)]
    issuer_email: Option<String>,

    /// Webroot served for ACME http-01 challenges
    #[arg(long, env = "MSTACK_CERTBOT_WEBROOT", default_value = "/var/www/certbot", global = true)]
    certbot_webroot: PathBuf,

    /// certbot live directory (<dir>/<domain>/cert.pem)
    #[arg(long, env = "MSTACK_CERT_DIR", default_value = "/etc/letsencrypt/live", global = true)]
    cert_dir: PathBuf,

    /// Use the ACME staging environment
    #[arg(long, env = "MSTACK_CERTBOT_STAGING", global = true)]
    certbot_staging: bool,

    /// Live proxy config file
    #[arg(long, env = "MSTACK_PROXY_CONFIG", default_value = "/etc/nginx/nginx.conf", global = true)]
    proxy_config: PathBuf,

    /// Command that makes the proxy load its config
    #[arg(long, env = "MSTACK_PROXY_RELOAD", default_value = "nginx -s reload", global = true)]
    proxy_reload: String,

    /// URL polled after a reload until it answers 2xx
    #[arg(long, env = "MSTACK_PROXY_HEALTH_URL", global = true)]
    proxy_health_url: Option<String>,

    /// Seconds to wait for the proxy health URL
    #[arg(long, env = "MSTACK_PROXY_READY_TIMEOUT", default_value = "30", global = true)]
    proxy_ready_timeout: u64,

    /// docker CLI binary (DOCKER_HOST selects the daemon)
    #[arg(long, env = "MSTACK_DOCKER", default_value = "docker", global = true)]
    docker: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until interrupted
    Run,

    /// Reconcile one resource now
    Reconcile {
        /// kind/id, or a bare id when unambiguous
        resource: String,

        /// Bypass the circuit breaker
        #[arg(long)]
        force: bool,
    },

    /// Show the last reconciliation and health of a resource
    Status {
        /// kind/id, or a bare id when unambiguous
        resource: String,

        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// List tracked resources
    List,

    /// Show the reconciliation log of a resource, newest first
    History {
        /// kind/id, or a bare id when unambiguous
        resource: String,

        /// Number of records
        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Debug, thiserror::Error)]
enum LookupError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("'{id}' is ambiguous, use one of: {candidates}")]
    Ambiguous { id: String, candidates: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mstack_agent=info,audit=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            let not_found = e.downcast_ref::<LookupError>().is_some()
                || matches!(e.downcast_ref::<StoreError>(), Some(StoreError::NotFound(_)));
            ExitCode::from(if not_found { EXIT_NOT_FOUND } else { EXIT_FAILED })
        }
    }
}

async fn execute(cli: Cli) -> Result<u8> {
    let store = open_store(&cli.data_dir).await?;
    let audit = create_audit_logger("agent");

    match cli.command {
        Commands::Run => {
            let state = sync_desired_state(&store, &cli.config, &audit).await?;
            run_daemon(store, &cli.adapters, state.policy, audit).await
        }

        Commands::Reconcile { resource, force } => {
            let state = sync_desired_state(&store, &cli.config, &audit).await?;
            let key = resolve(&store, &resource).await?;
            reconcile_once(store, &cli.adapters, state.policy, audit, key, force).await
        }

        Commands::Status { resource, json } => {
            let policy = load_policy(&cli.config);
            let key = resolve(&store, &resource).await?;
            let resource = store.load(&key).await?;
            let last = store.last_record(&key).await?;
            let health = store.health(&key, policy.max_consecutive_failures).await?;

            if json {
                let out = serde_json::json!({
                    "resource": key.to_string(),
                    "health": health,
                    "revision": resource.last_applied_revision,
                    "desired": resource.desired,
                    "observed": resource.observed,
                    "last_record": last,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Resource:  {}", key);
                println!("Health:    {}", health);
                println!("Revision:  {}", resource.last_applied_revision);
                println!(
                    "Observed:  {}",
                    resource
                        .observed
                        .as_ref()
                        .map(describe_observed)
                        .unwrap_or_else(|| "-".to_string())
                );
                match &last {
                    Some(record) => {
                        println!(
                            "Last run:  {} {}{}",
                            format_time(record.finished_at),
                            record.outcome,
                            if record.forced { " (forced)" } else { "" }
                        );
                        if let Some(detail) = &record.error_detail {
                            println!("Detail:    {}", detail);
                        }
                    }
                    None => println!("Last run:  never"),
                }
            }
            Ok(EXIT_OK)
        }

        Commands::List => {
            let policy = load_policy(&cli.config);
            let resources = store.list().await?;
            if resources.is_empty() {
                println!("No resources tracked");
                return Ok(EXIT_OK);
            }

            let mut rows = Vec::with_capacity(resources.len());
            for resource in resources {
                let key = resource.key();
                let last = store.last_record(&key).await?;
                let health = store.health(&key, policy.max_consecutive_failures).await?;
                rows.push(ResourceRow {
                    resource: key.to_string(),
                    revision: resource.last_applied_revision,
                    health: health.to_string(),
                    last_outcome: last
                        .as_ref()
                        .map(|r| r.outcome.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    last_run: last
                        .as_ref()
                        .map(|r| format_time(r.finished_at))
                        .unwrap_or_else(|| "-".to_string()),
                });
            }
            println!("{}", Table::new(rows));
            Ok(EXIT_OK)
        }

        Commands::History { resource, limit } => {
            let key = resolve(&store, &resource).await?;
            let records = store.records(&key, limit).await?;
            if records.is_empty() {
                println!("No reconciliations recorded for {}", key);
            } else {
                let rows: Vec<RecordRow> = records.iter().map(RecordRow::from).collect();
                println!("{}", Table::new(rows));
            }
            Ok(EXIT_OK)
        }
    }
}

async fn open_store(data_dir: &Path) -> Result<Arc<StateStore>> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let store = StateStore::open(data_dir)
        .await
        .with_context(|| format!("Failed to open state store in {}", data_dir.display()))?;
    Ok(Arc::new(store))
}

/// Load the desired-state file and bring the tracked resources in line with it.
async fn sync_desired_state(
    store: &StateStore,
    path: &Path,
    audit: &AuditLogger,
) -> Result<DesiredState> {
    let state = DesiredState::load(path)?;
    for (key, err) in &state.rejected {
        warn!(resource = %key, error = %err, "Desired spec rejected, keeping previous state");
    }
    for key in store.sync(&state).await? {
        audit.untracked(&key);
    }
    info!(
        resources = state.resources.len(),
        rejected = state.rejected.len(),
        "Desired state loaded"
    );
    Ok(state)
}

/// Policy for read-only commands; those work without a readable config.
fn load_policy(path: &Path) -> Policy {
    match DesiredState::load(path) {
        Ok(state) => state.policy,
        Err(e) => {
            debug!(error = %e, "Using default policy");
            Policy::default()
        }
    }
}

async fn resolve(store: &StateStore, resource: &str) -> Result<ResourceKey> {
    if resource.contains('/') {
        let key: ResourceKey = resource.parse().map_err(anyhow::Error::msg)?;
        store.load(&key).await?;
        return Ok(key);
    }

    let mut matches = store.find(resource).await?;
    match matches.len() {
        0 => Err(LookupError::NotFound(resource.to_string()).into()),
        1 => Ok(matches.remove(0)),
        _ => Err(LookupError::Ambiguous {
            id: resource.to_string(),
            candidates: matches
                .iter()
                .map(|k| k.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        }
        .into()),
    }
}

fn build_engine(
    store: Arc<StateStore>,
    args: &AdapterArgs,
    policy: &Policy,
    audit: Arc<AuditLogger>,
) -> ReconcileEngine {
    let adapters = Adapters {
        issuer: Arc::new(CertbotIssuer::new(
            args.certbot_webroot.clone(),
            args.cert_dir.clone(),
            args.certbot_staging,
        )),
        proxy: Arc::new(
            NginxController::new(args.proxy_config.clone())
                .with_reload_command(&args.proxy_reload)
                .with_health_url(args.proxy_health_url.clone())
                .with_ready_timeout(Duration::from_secs(args.proxy_ready_timeout)),
        ),
        orchestrator: Arc::new(SwarmController::new(args.docker.clone())),
    };
    let settings = EngineSettings {
        adapter_timeout: policy.adapter_timeout(),
        default_email: args.issuer_email.clone(),
    };
    ReconcileEngine::new(store, adapters, settings, audit)
}

async fn run_daemon(
    store: Arc<StateStore>,
    args: &AdapterArgs,
    policy: Policy,
    audit: Arc<AuditLogger>,
) -> Result<u8> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = build_engine(store, args, &policy, Arc::clone(&audit))
        .with_shutdown(shutdown_rx.clone());
    let (scheduler, channels) = Scheduler::new(Arc::new(engine), policy, audit);

    let mut handle = tokio::spawn(async move { scheduler.run(channels, shutdown_rx).await });

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
        result = &mut handle => {
            result.context("Scheduler task panicked")??;
            return Ok(EXIT_OK);
        }
    }

    let _ = shutdown_tx.send(true);
    handle.await.context("Scheduler task panicked")??;

    info!("Shutdown complete");
    Ok(EXIT_OK)
}

async fn reconcile_once(
    store: Arc<StateStore>,
    args: &AdapterArgs,
    policy: Policy,
    audit: Arc<AuditLogger>,
    key: ResourceKey,
    force: bool,
) -> Result<u8> {
    let engine = build_engine(store, args, &policy, Arc::clone(&audit));
    let (scheduler, mut channels) = Scheduler::new(Arc::new(engine), policy, audit);

    let report = match scheduler.trigger(key.clone(), TriggerSource::Manual, force).await? {
        Dispatch::Started(handle) => handle.await.context("Reconciliation task panicked")?,
        Dispatch::Coalesced => {
            println!("{}: attempt already in flight", key);
            return Ok(EXIT_OK);
        }
        Dispatch::Suppressed {
            consecutive_failures,
        } => {
            eprintln!(
                "{} is degraded after {} consecutive failures; rerun with --force",
                key, consecutive_failures
            );
            return Ok(EXIT_FAILED);
        }
    };
    let Some(report) = report else {
        return Err(fatal(&mut channels));
    };
    print_report(&report);

    // Follow-up triggers (proxy refresh after a deployment)
    while let Ok(next) = channels.events.try_recv() {
        if let Dispatch::Started(handle) = scheduler.trigger(next, TriggerSource::Event, false).await? {
            match handle.await.context("Reconciliation task panicked")? {
                Some(follow_up) => print_report(&follow_up),
                None => return Err(fatal(&mut channels)),
            }
        }
    }

    Ok(match report.outcome() {
        Outcome::Failed => EXIT_FAILED,
        Outcome::Success | Outcome::Skipped => EXIT_OK,
    })
}

fn fatal(channels: &mut SchedulerChannels) -> anyhow::Error {
    match channels.fatal.try_recv() {
        Ok(e) => anyhow::Error::new(e).context("State store failure"),
        Err(_) => anyhow::anyhow!("State store failure"),
    }
}

fn print_report(report: &AttemptReport) {
    let record = &report.record;
    let summary = match (record.outcome, &report.action, &record.error_detail) {
        (Outcome::Success, Some(action), _) => format!("{} (revision {})", action, record.revision),
        (Outcome::Skipped, None, None) => "up to date".to_string(),
        (_, _, Some(detail)) => detail.clone(),
        (_, Some(action), None) => action.to_string(),
        (_, None, None) => "-".to_string(),
    };
    println!("{}: {}: {}", record.resource, record.outcome, summary);
}

fn describe_observed(observed: &ObservedState) -> String {
    match observed {
        ObservedState::Certificate(o) => match &o.current {
            Some(cert) => format!("expires {} ({})", format_time(cert.not_after), cert.issuer),
            None => "no certificate".to_string(),
        },
        ObservedState::ProxyConfig(o) => format!(
            "active config {}",
            o.active_config_hash
                .as_deref()
                .map(|h| &h[..12.min(h.len())])
                .unwrap_or("none")
        ),
        ObservedState::ServiceDeployment(o) => format!(
            "{} x{} ({})",
            o.image_reference, o.replica_count, o.rollout_status
        ),
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "RESOURCE")]
    resource: String,
    #[tabled(rename = "REVISION")]
    revision: u64,
    #[tabled(rename = "HEALTH")]
    health: String,
    #[tabled(rename = "LAST OUTCOME")]
    last_outcome: String,
    #[tabled(rename = "LAST RUN")]
    last_run: String,
}

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "STARTED")]
    started: String,
    #[tabled(rename = "SECONDS")]
    seconds: i64,
    #[tabled(rename = "OUTCOME")]
    outcome: String,
    #[tabled(rename = "FORCED")]
    forced: bool,
    #[tabled(rename = "REVISION")]
    revision: u64,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

impl From<&ReconciliationRecord> for RecordRow {
    fn from(r: &ReconciliationRecord) -> Self {
        Self {
            started: format_time(r.started_at),
            seconds: (r.finished_at - r.started_at).num_seconds(),
            outcome: r.outcome.to_string(),
            forced: r.forced,
            revision: r.revision,
            detail: r.error_detail.clone().unwrap_or_else(|| "-".to_string()),
        }
    }
}

//! Trigger scheduling.
//!
//! Decides when a resource is reconciled: on startup, periodically with
//! jitter, when an event fires (a successful deployment re-triggers every
//! proxy config) or on manual request. At most one attempt per resource is
//! in flight; triggers for a busy resource are coalesced into the running
//! one. Resources past the failure threshold are skipped until forced.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::config::Policy;
use crate::error::{StoreError, StoreResult};
use crate::model::{Outcome, ResourceKey, ResourceKind};
use crate::reconciler::{AttemptReport, ReconcileEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Startup,
    Periodic,
    Event,
    Manual,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerSource::Startup => "startup",
            TriggerSource::Periodic => "periodic",
            TriggerSource::Event => "event",
            TriggerSource::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// What happened to a trigger.
#[derive(Debug)]
pub enum Dispatch {
    /// An attempt was started. Resolves to `None` if the store failed.
    Started(JoinHandle<Option<AttemptReport>>),
    /// An attempt for the resource is already running.
    Coalesced,
    /// The circuit breaker is open and the trigger was not forced.
    Suppressed { consecutive_failures: u32 },
}

/// Keys with an attempt in flight.
#[derive(Default)]
pub struct InFlight {
    keys: Mutex<HashSet<ResourceKey>>,
}

impl InFlight {
    /// Claim `key`, or `None` if it is already claimed. Never waits.
    pub fn try_acquire(self: &Arc<Self>, key: &ResourceKey) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            owner: Arc::clone(self),
            key: key.clone(),
        })
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

/// Releases the key when dropped.
pub struct InFlightGuard {
    owner: Arc<InFlight>,
    key: ResourceKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Receivers for the scheduler's internal signals.
pub struct SchedulerChannels {
    /// Keys re-triggered by events.
    pub events: mpsc::UnboundedReceiver<ResourceKey>,
    /// Store failures from attempts. These end the process.
    pub fatal: mpsc::UnboundedReceiver<StoreError>,
}

pub struct Scheduler {
    engine: Arc<ReconcileEngine>,
    in_flight: Arc<InFlight>,
    policy: Policy,
    audit: Arc<AuditLogger>,
    events_tx: mpsc::UnboundedSender<ResourceKey>,
    fatal_tx: mpsc::UnboundedSender<StoreError>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<ReconcileEngine>,
        policy: Policy,
        audit: Arc<AuditLogger>,
    ) -> (Arc<Self>, SchedulerChannels) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (fatal_tx, fatal) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            engine,
            in_flight: Arc::new(InFlight::default()),
            policy,
            audit,
            events_tx,
            fatal_tx,
        });
        (scheduler, SchedulerChannels { events, fatal })
    }

    pub fn is_in_flight(&self, key: &ResourceKey) -> bool {
        self.in_flight.contains(key)
    }

    /// Start an attempt for `key` unless one is running or the breaker is open.
    ///
    /// `force` bypasses the breaker only; the attempt still diffs first.
    pub async fn trigger(
        self: &Arc<Self>,
        key: ResourceKey,
        source: TriggerSource,
        force: bool,
    ) -> StoreResult<Dispatch> {
        let Some(guard) = self.in_flight.try_acquire(&key) else {
            debug!(resource = %key, %source, "Attempt in flight, coalescing trigger");
            return Ok(Dispatch::Coalesced);
        };

        let failures = self.engine.store().consecutive_failures(&key).await?;
        if failures >= self.policy.max_consecutive_failures {
            if !force {
                debug!(resource = %key, %source, failures, "Circuit open, trigger suppressed");
                return Ok(Dispatch::Suppressed {
                    consecutive_failures: failures,
                });
            }
            self.audit.forced(&key, failures);
        }

        debug!(resource = %key, %source, force, "Starting attempt");
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let result = match this.engine.reconcile(&key, force).await {
                Ok(report) => this.after_attempt(&key, &report).await.map(|()| report),
                Err(e) => Err(e),
            };
            match result {
                Ok(report) => Some(report),
                Err(e) => {
                    error!(resource = %key, error = %e, "State store failure");
                    let _ = this.fatal_tx.send(e);
                    None
                }
            }
        });

        Ok(Dispatch::Started(handle))
    }

    async fn after_attempt(&self, key: &ResourceKey, report: &AttemptReport) -> StoreResult<()> {
        match report.outcome() {
            Outcome::Failed => {
                let failures = self.engine.store().consecutive_failures(key).await?;
                if failures == self.policy.max_consecutive_failures {
                    self.audit.degraded(key, failures);
                }
            }
            Outcome::Success if key.kind == ResourceKind::ServiceDeployment => {
                for proxy in self.engine.store().list_keys(ResourceKind::ProxyConfig).await? {
                    debug!(resource = %proxy, after = %key, "Queueing proxy refresh");
                    let _ = self.events_tx.send(proxy);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn next_run(&self) -> Duration {
        jittered(self.policy.interval(), self.policy.jitter())
    }

    /// Dispatch a trigger, keeping started attempts so shutdown can wait for them.
    async fn dispatch(
        self: &Arc<Self>,
        key: ResourceKey,
        source: TriggerSource,
        running: &mut Vec<JoinHandle<Option<AttemptReport>>>,
    ) -> StoreResult<()> {
        match self.trigger(key.clone(), source, false).await? {
            Dispatch::Started(handle) => running.push(handle),
            Dispatch::Coalesced => {}
            Dispatch::Suppressed {
                consecutive_failures,
            } => {
                warn!(resource = %key, consecutive_failures, "Skipping degraded resource")
            }
        }
        Ok(())
    }

    /// Daemon loop. Returns when `shutdown` turns true (after in-flight
    /// attempts finish) or with the first store failure.
    pub async fn run(
        self: &Arc<Self>,
        mut channels: SchedulerChannels,
        mut shutdown: watch::Receiver<bool>,
    ) -> StoreResult<()> {
        let start = Instant::now();
        let mut next_due: HashMap<ResourceKey, Instant> = self
            .engine
            .store()
            .list()
            .await?
            .iter()
            .map(|r| (r.key(), start))
            .collect();
        let mut first_pass: HashSet<ResourceKey> = next_due.keys().cloned().collect();
        let mut running = Vec::new();

        info!(
            resources = next_due.len(),
            interval_secs = self.policy.reconcile_interval_secs,
            "Scheduler started"
        );

        loop {
            let now = Instant::now();
            let due: Vec<ResourceKey> = next_due
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for key in due {
                let source = if first_pass.remove(&key) {
                    TriggerSource::Startup
                } else {
                    TriggerSource::Periodic
                };
                next_due.insert(key.clone(), now + self.next_run());
                self.dispatch(key, source, &mut running).await?;
            }
            running.retain(|h| !h.is_finished());

            let wake = next_due
                .values()
                .min()
                .copied()
                .unwrap_or_else(|| now + self.policy.interval());

            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                Some(key) = channels.events.recv() => {
                    self.dispatch(key, TriggerSource::Event, &mut running).await?;
                }
                Some(err) = channels.fatal.recv() => {
                    return Err(err);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = running.len(), "Scheduler stopping, waiting for attempts");
        for handle in running {
            let _ = handle.await;
        }
        match channels.fatal.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}

/// `interval` plus a random whole number of seconds up to `jitter`.
fn jittered(interval: Duration, jitter: Duration) -> Duration {
    let max = jitter.as_secs();
    let offset = if max == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=max)
    };
    interval + Duration::from_secs(offset)
}

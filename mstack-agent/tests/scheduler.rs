//! Trigger coalescing, circuit breaking and event triggers.

mod common;

use std::time::Duration;

use common::{key, Harness};
use mstack_agent::config::Policy;
use mstack_agent::model::{Outcome, ResourceHealth};
use mstack_agent::scheduler::{Dispatch, TriggerSource};
use tokio::sync::watch;

const CERT_CONFIG: &str = "certificates:\n  - domain: example.com\n";

fn policy(max_failures: u32) -> Policy {
    Policy {
        max_consecutive_failures: max_failures,
        ..Policy::default()
    }
}

async fn finish(dispatch: Dispatch) -> Outcome {
    match dispatch {
        Dispatch::Started(handle) => handle.await.unwrap().unwrap().outcome(),
        other => panic!("expected a started attempt, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_triggers_coalesce() {
    let h = Harness::new().await;
    h.apply_config(CERT_CONFIG).await;
    let (scheduler, _channels) = h.scheduler(policy(3));
    let k = key("certificate/example.com");
    let gate = h.issuer.gate();

    let first = scheduler
        .trigger(k.clone(), TriggerSource::Manual, false)
        .await
        .unwrap();
    let second = scheduler
        .trigger(k.clone(), TriggerSource::Periodic, false)
        .await
        .unwrap();
    assert!(matches!(first, Dispatch::Started(_)));
    assert!(matches!(second, Dispatch::Coalesced));
    assert!(scheduler.is_in_flight(&k));

    gate.notify_one();
    assert_eq!(finish(first).await, Outcome::Success);

    assert!(!scheduler.is_in_flight(&k));
    assert_eq!(h.store.records(&k, 10).await.unwrap().len(), 1);
    assert_eq!(h.issuer.issue_calls(), 1);
}

#[tokio::test]
async fn test_breaker_opens_after_repeated_failures() {
    let h = Harness::new().await;
    h.apply_config(CERT_CONFIG).await;
    h.issuer.set_failing(true);
    let (scheduler, _channels) = h.scheduler(policy(3));
    let k = key("certificate/example.com");

    for _ in 0..3 {
        let dispatch = scheduler
            .trigger(k.clone(), TriggerSource::Periodic, false)
            .await
            .unwrap();
        assert_eq!(finish(dispatch).await, Outcome::Failed);
    }

    let suppressed = scheduler
        .trigger(k.clone(), TriggerSource::Periodic, false)
        .await
        .unwrap();
    assert!(matches!(
        suppressed,
        Dispatch::Suppressed {
            consecutive_failures: 3
        }
    ));
    assert_eq!(h.store.records(&k, 10).await.unwrap().len(), 3);
    assert_eq!(
        h.store.health(&k, 3).await.unwrap(),
        ResourceHealth::Degraded {
            consecutive_failures: 3
        }
    );

    // Forced attempt goes through and, once it succeeds, closes the breaker.
    h.issuer.set_failing(false);
    let forced = scheduler
        .trigger(k.clone(), TriggerSource::Manual, true)
        .await
        .unwrap();
    assert_eq!(finish(forced).await, Outcome::Success);

    let last = h.store.last_record(&k).await.unwrap().unwrap();
    assert!(last.forced);
    assert_eq!(h.store.health(&k, 3).await.unwrap(), ResourceHealth::Healthy);

    let automatic = scheduler
        .trigger(k.clone(), TriggerSource::Periodic, false)
        .await
        .unwrap();
    assert_eq!(finish(automatic).await, Outcome::Skipped);
}

#[tokio::test]
async fn test_breaker_survives_restart() {
    let h = Harness::new().await;
    h.apply_config(CERT_CONFIG).await;
    h.issuer.set_failing(true);
    let k = key("certificate/example.com");

    {
        let (scheduler, _channels) = h.scheduler(policy(2));
        for _ in 0..2 {
            let dispatch = scheduler
                .trigger(k.clone(), TriggerSource::Periodic, false)
                .await
                .unwrap();
            finish(dispatch).await;
        }
    }

    let (scheduler, _channels) = h.scheduler(policy(2));
    let dispatch = scheduler
        .trigger(k.clone(), TriggerSource::Startup, false)
        .await
        .unwrap();
    assert!(matches!(dispatch, Dispatch::Suppressed { .. }));
}

#[tokio::test]
async fn test_successful_deployment_triggers_proxy() {
    let h = Harness::new().await;
    h.orchestrator
        .with_service("app_backend", "registry.local/backend:1.4.2", 1);
    let template = h.write_template("{{ upstreams }}\n");
    h.apply_config(&format!(
        "proxy:\n  template_path: {}\n  targets: [backend:8000]\ndeployments:\n  - service_id: app_backend\n    image_reference: registry.local/backend:1.5.0\n",
        template.display()
    ))
    .await;
    let (scheduler, mut channels) = h.scheduler(policy(3));

    let dispatch = scheduler
        .trigger(key("deployment/app_backend"), TriggerSource::Manual, false)
        .await
        .unwrap();
    assert_eq!(finish(dispatch).await, Outcome::Success);

    assert_eq!(channels.events.try_recv().unwrap(), key("proxy/proxy"));
    assert!(channels.events.try_recv().is_err());
}

#[tokio::test]
async fn test_noop_deployment_does_not_trigger_proxy() {
    let h = Harness::new().await;
    h.orchestrator
        .with_service("app_backend", "registry.local/backend:1.5.0", 1);
    let template = h.write_template("{{ upstreams }}\n");
    h.apply_config(&format!(
        "proxy:\n  template_path: {}\ndeployments:\n  - service_id: app_backend\n    image_reference: registry.local/backend:1.5.0\n",
        template.display()
    ))
    .await;
    let (scheduler, mut channels) = h.scheduler(policy(3));

    let dispatch = scheduler
        .trigger(key("deployment/app_backend"), TriggerSource::Manual, false)
        .await
        .unwrap();
    assert_eq!(finish(dispatch).await, Outcome::Skipped);
    assert!(channels.events.try_recv().is_err());
}

#[tokio::test]
async fn test_run_reconciles_on_startup_and_stops() {
    let h = Harness::new().await;
    h.orchestrator
        .with_service("app_backend", "registry.local/backend:1.4.2", 1);
    let template = h.write_template("{{ upstreams }}\n");
    h.apply_config(&format!(
        "certificates:\n  - domain: example.com\nproxy:\n  template_path: {}\ndeployments:\n  - service_id: app_backend\n    image_reference: registry.local/backend:1.5.0\n",
        template.display()
    ))
    .await;
    let (scheduler, channels) = h.scheduler(policy(3));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(channels, shutdown_rx).await })
    };

    let cert = key("certificate/example.com");
    let deployment = key("deployment/app_backend");
    let proxy = key("proxy/proxy");
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let cert_done = h.store.last_record(&cert).await.unwrap().is_some();
            let deploy_done = h.store.last_record(&deployment).await.unwrap().is_some();
            let proxy_runs = h.store.records(&proxy, 10).await.unwrap().len();
            if cert_done && deploy_done && proxy_runs >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("startup reconciliation did not finish");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .expect("scheduler did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(
        h.orchestrator.service("app_backend").unwrap().image.as_str(),
        "registry.local/backend:1.5.0"
    );
    assert!(h.issuer.issue_calls() >= 1);
}

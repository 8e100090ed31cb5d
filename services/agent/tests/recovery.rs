//! Integration tests for startup recovery.
//!
//! An agent restart is simulated by building a second manager over the same
//! data dir and the same MockRuntime, whose workloads kept running.

mod common;

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use common::Harness;
use hostdeck_agent::manager::INTERRUPTED;
use hostdeck_agent::runtime::RuntimeHandle;
use hostdeck_agent::state::StateStore;
use hostdeck_agent::{AccessPolicy, App, AppStatus, RecoveryError, Variant};
use hostdeck_id::AppId;

#[tokio::test]
async fn test_live_app_is_adopted_and_dead_route_dropped() {
    let mut h = Harness::new(&[9001, 9002, 9003], &[(0, 8000)]);
    let mut request = h.request("a");
    request.vram_required_mb = 2000;
    let a = h.manager.deploy(request).await.unwrap().app;
    let b = h.manager.deploy(h.request("b")).await.unwrap().app;

    // B dies while the agent is down.
    h.manager.shutdown();
    h.runtime.vanish(b.id);

    let manager = h.restart_agent();
    let report = manager.recover().await.unwrap();

    assert_eq!(report.adopted, vec![a.id]);
    assert_eq!(report.dropped, vec![b.id]);

    let recovered = manager.get(a.id).await.unwrap();
    assert_eq!(recovered.status, AppStatus::Running);
    assert_eq!(recovered.port, Some(9001));
    assert_eq!(recovered.gpu_indices(), vec![0]);
    assert!(manager.is_supervised(a.id));

    let routes = manager.proxy().routes().await;
    assert_eq!(routes.keys().copied().collect::<Vec<_>>(), vec![a.id]);
    assert_eq!(manager.proxy().load_declared().unwrap(), routes);
    assert!(!h.rendered_config().contains(&b.id.to_string()));

    let b_after = manager.get(b.id).await.unwrap();
    assert_eq!(b_after.status, AppStatus::Error);
    assert_eq!(b_after.error.as_deref(), Some(INTERRUPTED));

    // Allocations were re-registered: A's port and GPU memory stay taken,
    // B's port is free again.
    let reservations = manager.resources().gpus().reservations().await;
    assert_eq!(reservations.get(&a.id).map(Vec::len), Some(1));
    let c = manager.deploy(h.request("c")).await.unwrap().app;
    assert_eq!(c.port, Some(9002));
}

#[tokio::test]
async fn test_recovery_is_idempotent() {
    let mut h = Harness::new(&[9001, 9002], &[]);
    let a = h.manager.deploy(h.request("a")).await.unwrap().app;

    let manager = h.restart_agent();
    let first = manager.recover().await.unwrap();
    let apps_after_first = manager.list().await;
    let routes_after_first = manager.proxy().routes().await;
    let generation = manager.supervisor_generation(a.id);
    let reloads = h.reloader.reloads();

    let second = manager.recover().await.unwrap();

    assert_eq!(first.adopted, second.adopted);
    assert!(second.dropped.is_empty());
    assert_eq!(manager.proxy().routes().await, routes_after_first);
    assert_eq!(manager.supervisor_generation(a.id), generation);
    assert_eq!(
        manager.list().await.iter().map(|a| (a.id, a.status, a.port)).collect::<Vec<_>>(),
        apps_after_first.iter().map(|a| (a.id, a.status, a.port)).collect::<Vec<_>>()
    );
    // Identical configuration is not reloaded again.
    assert_eq!(h.reloader.reloads(), reloads);
}

#[tokio::test]
async fn test_unmanaged_workloads_are_left_alone() {
    let mut h = Harness::new(&[9001], &[]);
    let stranger = AppId::new();
    h.runtime.spawn_external(
        stranger,
        RuntimeHandle::Container {
            name: "someone-elses-app".to_string(),
        },
    );

    let manager = h.restart_agent();
    let report = manager.recover().await.unwrap();

    assert!(report.adopted.is_empty());
    assert_eq!(report.unmanaged.len(), 1);
    assert!(h.runtime.is_running(stranger));
    assert!(manager.get(stranger).await.is_none());
    assert!(manager.proxy().routes().await.is_empty());
}

#[tokio::test]
async fn test_corrupt_routes_file_is_fatal() {
    let mut h = Harness::new(&[9001], &[]);
    std::fs::write(h.routes_path(), "{ not json").unwrap();

    let manager = h.restart_agent();
    let err = manager.recover().await.unwrap_err();

    assert!(matches!(err, RecoveryError::Routes(_)));
}

#[tokio::test]
async fn test_missing_routes_file_recovers_nothing() {
    let mut h = Harness::new(&[9001], &[]);

    let manager = h.restart_agent();
    let report = manager.recover().await.unwrap();

    assert!(report.adopted.is_empty());
    assert!(report.dropped.is_empty());
    assert!(manager.list().await.is_empty());
}

#[tokio::test]
async fn test_interrupted_deploy_is_marked_error() {
    let mut h = Harness::new(&[9001], &[]);
    let app_id = AppId::new();
    let now = Utc::now();
    let half_deployed = App {
        id: app_id,
        variant: Variant::Image,
        status: AppStatus::Deploying,
        source: PathBuf::from("/srv/bundles/x"),
        port: Some(9001),
        last_port: Some(9001),
        gpus: vec![],
        vram_required_mb: 0,
        access: AccessPolicy::default(),
        container_port: None,
        entrypoint: None,
        artifact: None,
        handle: None,
        error: None,
        generation: 1,
        created_at: now,
        updated_at: now,
    };
    StateStore::open(h.dir.path().join("agent.db"))
        .unwrap()
        .upsert_app(&half_deployed)
        .unwrap();

    let manager = h.restart_agent();
    let report = manager.recover().await.unwrap();

    assert_eq!(report.interrupted, vec![app_id]);
    let app = manager.get(app_id).await.unwrap();
    assert_eq!(app.status, AppStatus::Error);
    assert_eq!(app.error.as_deref(), Some(INTERRUPTED));
    assert_eq!(app.port, None);
    assert!(manager.resources().ports().assigned().is_empty());
}

#[tokio::test]
async fn test_adopted_app_is_supervised() {
    let mut h = Harness::new(&[9001], &[]);
    let a = h.manager.deploy(h.request("a")).await.unwrap().app;

    let manager = h.restart_agent();
    manager.recover().await.unwrap();

    h.runtime.crash(a.id);
    let after = h
        .wait_for(&a, Duration::from_secs(2), |app| app.status != AppStatus::Running)
        .await;

    assert_eq!(after.status, AppStatus::Error);
    assert!(manager.proxy().routes().await.is_empty());
    assert!(manager.resources().ports().assigned().is_empty());
}

#[tokio::test]
async fn test_adopted_app_can_be_stopped() {
    let mut h = Harness::new(&[9001], &[]);
    let a = h.manager.deploy(h.request("a")).await.unwrap().app;

    let manager = h.restart_agent();
    manager.recover().await.unwrap();

    let stopped = manager.stop(a.id).await.unwrap().app;

    assert_eq!(stopped.status, AppStatus::Stopped);
    assert!(!h.runtime.is_running(a.id));
}

#[tokio::test]
async fn test_unlistable_runtime_keeps_declared_routes() {
    let mut h = Harness::new(&[9001, 9002], &[]);
    let a = h.manager.deploy(h.request("a")).await.unwrap().app;
    let b = h.manager.deploy(h.request("b")).await.unwrap().app;

    // The container engine is unreachable at agent start, and B died
    // while the agent was down.
    h.manager.shutdown();
    h.runtime.vanish(b.id);
    h.runtime.set_fail_listing(true);

    let manager = h.restart_agent();
    let report = manager.recover().await.unwrap();

    let mut both = vec![a.id, b.id];
    both.sort();
    assert_eq!(report.adopted, both);
    assert!(report.dropped.is_empty());
    assert_eq!(report.warnings.len(), 1);

    // Supervision settles what listing could not.
    let b_after = h
        .wait_for(&b, Duration::from_secs(2), |app| app.status != AppStatus::Running)
        .await;
    assert_eq!(b_after.status, AppStatus::Error);
    assert_eq!(b_after.error.as_deref(), Some("runtime disappeared"));
    assert_eq!(manager.get(a.id).await.unwrap().status, AppStatus::Running);
    assert_eq!(
        manager.proxy().load_declared().unwrap().keys().copied().collect::<Vec<_>>(),
        vec![a.id]
    );

    // Once listing works again, A is still adoptable.
    h.runtime.set_fail_listing(false);
    let manager = h.restart_agent();
    let report = manager.recover().await.unwrap();

    assert_eq!(report.adopted, vec![a.id]);
    assert!(report.warnings.is_empty());
    assert_eq!(manager.get(a.id).await.unwrap().status, AppStatus::Running);
    assert!(h.runtime.is_running(a.id));
}

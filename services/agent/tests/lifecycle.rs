//! Integration tests for deploy, stop, restart and delete.
//!
//! Everything runs against MockRuntime and MockReloader; the route table,
//! generated config and state DB are real files in a temp dir.

mod common;

use common::{recording_control_plane, reported_statuses, Harness};
use hostdeck_agent::runtime::{Artifact, Runtime, StartSpec};
use hostdeck_agent::{AppStatus, LaunchError};

/// Every running app has a route and nothing else does.
async fn assert_route_invariant(h: &Harness) {
    let routes = h.manager.proxy().routes().await;
    for app in h.manager.list().await {
        assert_eq!(
            app.status == AppStatus::Running,
            routes.contains_key(&app.id),
            "app {} is {} but route present = {}",
            app.id,
            app.status,
            routes.contains_key(&app.id)
        );
    }
    let on_disk = h.manager.proxy().load_declared().unwrap();
    assert_eq!(on_disk, routes);
}

#[tokio::test]
async fn test_deploy_script_app() {
    let h = Harness::new(&[9001, 9002], &[]);

    let outcome = h.manager.deploy(h.request("hello")).await.unwrap();
    let app = outcome.app;

    assert_eq!(app.status, AppStatus::Running);
    assert_eq!(app.port, Some(9001));
    assert_eq!(app.url(), format!("/apps/{}/", app.id));
    assert!(outcome.warnings.is_empty());
    assert!(matches!(app.artifact, Some(Artifact::Script { .. })));
    assert!(h.manager.is_supervised(app.id));

    let starts = h.runtime.starts();
    assert_eq!(starts.len(), 1);
    let StartSpec::Process(command) = &starts[0].1 else {
        panic!("script apps run as processes");
    };
    assert!(command.env.contains(&("PORT".to_string(), "9001".to_string())));

    let config = h.rendered_config();
    assert!(config.contains(&format!("location /apps/{}/", app.id)));
    assert!(config.contains("proxy_pass http://127.0.0.1:9001/;"));
    assert_eq!(h.reloader.reloads(), 1);

    assert_route_invariant(&h).await;
}

#[tokio::test]
async fn test_stop_releases_port_and_route() {
    let h = Harness::new(&[9001], &[]);
    let app = h.manager.deploy(h.request("a")).await.unwrap().app;

    let stopped = h.manager.stop(app.id).await.unwrap().app;

    assert_eq!(stopped.status, AppStatus::Stopped);
    assert_eq!(stopped.port, None);
    assert!(stopped.handle.is_none());
    assert!(!h.runtime.is_running(app.id));
    assert!(!h.manager.is_supervised(app.id));
    assert!(h.manager.resources().ports().assigned().is_empty());
    assert!(!h.rendered_config().contains(&app.id.to_string()));
    assert_route_invariant(&h).await;

    // The freed port is reusable straight away.
    let next = h.manager.deploy(h.request("b")).await.unwrap().app;
    assert_eq!(next.port, Some(9001));
}

#[tokio::test]
async fn test_stop_is_a_noop_when_already_stopped() {
    let h = Harness::new(&[9001], &[]);
    let app = h.manager.deploy(h.request("a")).await.unwrap().app;

    h.manager.stop(app.id).await.unwrap();
    let again = h.manager.stop(app.id).await.unwrap();

    assert_eq!(again.app.status, AppStatus::Stopped);
}

#[tokio::test]
async fn test_stop_timeout_still_marks_stopped() {
    let h = Harness::new(&[9001], &[]);
    let app = h.manager.deploy(h.request("a")).await.unwrap().app;
    h.runtime.set_hang_on_stop(true);

    let stopped = h.manager.stop(app.id).await.unwrap().app;

    assert_eq!(stopped.status, AppStatus::Stopped);
    assert!(h.manager.resources().ports().assigned().is_empty());
}

#[tokio::test]
async fn test_restart_prefers_previous_port() {
    let h = Harness::new(&[9001, 9002, 9003], &[]);
    let a = h.manager.deploy(h.request("a")).await.unwrap().app;
    let b = h.manager.deploy(h.request("b")).await.unwrap().app;
    assert_eq!(b.port, Some(9002));

    h.manager.stop(a.id).await.unwrap();
    h.manager.stop(b.id).await.unwrap();

    let restarted = h.manager.restart(b.id).await.unwrap().app;

    assert_eq!(restarted.status, AppStatus::Running);
    assert_eq!(restarted.port, Some(9002));
    assert_eq!(restarted.generation, b.generation + 1);
    // Restart reuses the artifact instead of rebuilding.
    assert_eq!(h.runtime.starts().len(), 3);
    assert_route_invariant(&h).await;
}

#[tokio::test]
async fn test_restart_falls_back_when_previous_port_taken() {
    let h = Harness::new(&[9001, 9002], &[]);
    let a = h.manager.deploy(h.request("a")).await.unwrap().app;
    h.manager.stop(a.id).await.unwrap();
    let b = h.manager.deploy(h.request("b")).await.unwrap().app;
    assert_eq!(b.port, Some(9001));

    let restarted = h.manager.restart(a.id).await.unwrap().app;
    assert_eq!(restarted.port, Some(9002));
}

#[tokio::test]
async fn test_restart_of_running_app_is_rejected() {
    let h = Harness::new(&[9001], &[]);
    let app = h.manager.deploy(h.request("a")).await.unwrap().app;

    let err = h.manager.restart(app.id).await.unwrap_err();
    assert!(matches!(
        err,
        LaunchError::InvalidState {
            status: AppStatus::Running,
            operation: "restart",
            ..
        }
    ));
}

#[tokio::test]
async fn test_restart_without_artifact_is_not_restartable() {
    let h = Harness::new(&[9001], &[]);
    let app = h.manager.deploy(h.request("a")).await.unwrap().app;
    h.manager.stop(app.id).await.unwrap();

    h.runtime
        .remove_artifact(app.artifact.as_ref().unwrap())
        .await
        .unwrap();

    let err = h.manager.restart(app.id).await.unwrap_err();
    assert!(matches!(err, LaunchError::NotRestartable(id) if id == app.id));
    assert!(h.manager.resources().ports().assigned().is_empty());
}

#[tokio::test]
async fn test_build_failure_releases_resources() {
    let h = Harness::new(&[9001], &[(0, 8000)]);
    let bundle = h.script_bundle("needs-deps");
    std::fs::write(bundle.join("requirements.txt"), "gradio\n").unwrap();
    h.runtime.set_fail_builds(true);

    let mut request = hostdeck_agent::DeployRequest::new(bundle);
    request.vram_required_mb = 2000;
    let err = h.manager.deploy(request).await.unwrap_err();

    assert!(matches!(err, LaunchError::BuildFailed { .. }));
    let apps = h.manager.list().await;
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].status, AppStatus::Error);
    assert!(apps[0].error.as_deref().unwrap().contains("build failed"));
    assert!(h.manager.resources().ports().assigned().is_empty());
    assert!(h.manager.resources().gpus().reservations().await.is_empty());
    assert_route_invariant(&h).await;

    let log = h.manager.read_log(apps[0].id).await.unwrap();
    assert!(log.contains("launch failed"));
}

#[tokio::test]
async fn test_start_failure_releases_resources() {
    let h = Harness::new(&[9001], &[]);
    h.runtime.set_fail_starts(true);

    let err = h.manager.deploy(h.request("a")).await.unwrap_err();

    assert!(matches!(err, LaunchError::LaunchFailed { .. }));
    assert!(h.manager.resources().ports().assigned().is_empty());
    assert!(h.manager.proxy().routes().await.is_empty());
}

#[tokio::test]
async fn test_degraded_reload_surfaces_warning() {
    let h = Harness::new(&[9001], &[]);
    h.reloader.set_failing(true);

    let outcome = h.manager.deploy(h.request("a")).await.unwrap();

    assert_eq!(outcome.app.status, AppStatus::Running);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("reload"));
    // Route recorded even though the proxy did not pick it up.
    assert!(h.manager.proxy().contains(outcome.app.id).await);

    // The next change retries the reload.
    h.reloader.set_failing(false);
    let stopped = h.manager.stop(outcome.app.id).await.unwrap();
    assert!(stopped.warnings.is_empty());
    assert!(h.reloader.reloads() >= 1);
}

#[tokio::test]
async fn test_delete_running_app_removes_everything() {
    let h = Harness::new(&[9001], &[]);
    let app = h.manager.deploy(h.request("a")).await.unwrap().app;
    let log = h.manager.log_path(app.id);
    assert!(log.exists());

    let warnings = h.manager.delete(app.id).await.unwrap();

    assert!(warnings.is_empty());
    assert!(h.manager.get(app.id).await.is_none());
    assert!(!h.runtime.is_running(app.id));
    assert!(!log.exists());
    assert!(h.manager.resources().ports().assigned().is_empty());
    assert!(!h
        .runtime
        .artifact_present(app.artifact.as_ref().unwrap())
        .await
        .unwrap());
    assert!(matches!(
        h.manager.delete(app.id).await,
        Err(LaunchError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_deploy_rejects_bad_requests() {
    let h = Harness::new(&[9001], &[]);

    let missing = hostdeck_agent::DeployRequest::new(h.dir.path().join("nope"));
    assert!(matches!(
        h.manager.deploy(missing).await,
        Err(LaunchError::InvalidRequest(_))
    ));

    let mut bad_access = h.request("a");
    bad_access.allow_ips = vec!["10.0.0.1; allow all".to_string()];
    assert!(matches!(
        h.manager.deploy(bad_access).await,
        Err(LaunchError::InvalidRequest(_))
    ));

    assert!(h.manager.list().await.is_empty());
    assert!(h.manager.resources().ports().assigned().is_empty());
}

#[tokio::test]
async fn test_access_policy_reaches_generated_config() {
    let h = Harness::new(&[9001], &[]);
    let mut request = h.request("private");
    request.allow_ips = vec!["10.0.0.0/8".to_string()];
    request.auth_header = Some("s3cret".to_string());

    h.manager.deploy(request).await.unwrap();

    let config = h.rendered_config();
    assert!(config.contains("allow 10.0.0.0/8;"));
    assert!(config.contains("deny all;"));
    assert!(config.contains("Bearer s3cret"));
}

#[tokio::test]
async fn test_records_survive_in_store() {
    let mut h = Harness::new(&[9001], &[]);
    let app = h.manager.deploy(h.request("a")).await.unwrap().app;
    h.manager.stop(app.id).await.unwrap();

    let manager = h.restart_agent();
    manager.recover().await.unwrap();

    let loaded = manager.get(app.id).await.unwrap();
    assert_eq!(loaded.status, AppStatus::Stopped);
    assert!(loaded.artifact.is_some());

    // Restart works from the persisted artifact.
    let restarted = manager.restart(app.id).await.unwrap().app;
    assert_eq!(restarted.status, AppStatus::Running);
}

#[tokio::test]
async fn test_script_without_dependencies_skips_deploying() {
    let (server, reporter) = recording_control_plane().await;
    let h = Harness::with_reporter(&[9001], &[], reporter);

    let app = h.manager.deploy(h.request("plain")).await.unwrap().app;

    let statuses = reported_statuses(&server, app.id, 2).await;
    assert_eq!(statuses, vec![AppStatus::Starting, AppStatus::Running]);
    assert!(h.runtime.builds().is_empty());
}

#[tokio::test]
async fn test_script_with_dependencies_reports_deploying() {
    let (server, reporter) = recording_control_plane().await;
    let h = Harness::with_reporter(&[9001], &[], reporter);
    let bundle = h.script_bundle("with-deps");
    std::fs::write(bundle.join("requirements.txt"), "gradio\n").unwrap();

    let app = h
        .manager
        .deploy(hostdeck_agent::DeployRequest::new(bundle))
        .await
        .unwrap()
        .app;

    let statuses = reported_statuses(&server, app.id, 3).await;
    assert_eq!(
        statuses,
        vec![AppStatus::Deploying, AppStatus::Starting, AppStatus::Running]
    );
}

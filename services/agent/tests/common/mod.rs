//! Shared harness: a full agent wired to mock backends in a temp dir.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hostdeck_agent::backoff::BackoffPolicy;
use hostdeck_agent::client::{ControlPlaneClient, StatusUpdate};
use hostdeck_agent::config::Config;
use hostdeck_agent::launch::LaunchSettings;
use hostdeck_agent::manager::{AppManager, DeployRequest, ManagerSettings};
use hostdeck_agent::proxy::{MockReloader, ProxyConfigurator, ProxySettings};
use hostdeck_agent::reporter::StatusReporter;
use hostdeck_agent::resources::{GpuPool, PortPool, ResourcePool, StaticGpuProbe, StaticPortProbe};
use hostdeck_agent::runtime::MockRuntime;
use hostdeck_agent::state::StateStore;
use hostdeck_agent::{App, AppStatus};
use hostdeck_id::AppId;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SUPERVISE_INTERVAL: Duration = Duration::from_millis(20);

pub struct Harness {
    pub dir: TempDir,
    pub ports: Vec<u16>,
    pub gpus: Arc<StaticGpuProbe>,
    pub port_probe: Arc<StaticPortProbe>,
    pub runtime: Arc<MockRuntime>,
    pub reloader: Arc<MockReloader>,
    pub reporter: StatusReporter,
    pub manager: Arc<AppManager>,
}

impl Harness {
    pub fn new(ports: &[u16], gpus: &[(u32, u64)]) -> Self {
        Self::with_reporter(ports, gpus, StatusReporter::noop())
    }

    /// Harness whose manager pushes status changes through `reporter`.
    pub fn with_reporter(ports: &[u16], gpus: &[(u32, u64)], reporter: StatusReporter) -> Self {
        let dir = TempDir::new().unwrap();
        let gpus = Arc::new(StaticGpuProbe::with_free(gpus));
        let port_probe = Arc::new(StaticPortProbe::new());
        let runtime = Arc::new(MockRuntime::new());
        let reloader = Arc::new(MockReloader::new());

        let manager = build_manager(
            &dir,
            ports,
            Arc::clone(&gpus),
            Arc::clone(&port_probe),
            Arc::clone(&runtime),
            Arc::clone(&reloader),
            reporter.clone(),
        );

        Self {
            dir,
            ports: ports.to_vec(),
            gpus,
            port_probe,
            runtime,
            reloader,
            reporter,
            manager,
        }
    }

    /// Simulate an agent restart: fresh manager over the same data dir and
    /// the same (still running) workloads. The old manager stops supervising.
    pub fn restart_agent(&mut self) -> Arc<AppManager> {
        self.manager.shutdown();
        self.manager = build_manager(
            &self.dir,
            &self.ports,
            Arc::clone(&self.gpus),
            Arc::clone(&self.port_probe),
            Arc::clone(&self.runtime),
            Arc::clone(&self.reloader),
            self.reporter.clone(),
        );
        Arc::clone(&self.manager)
    }

    /// A script bundle containing `app.py`.
    pub fn script_bundle(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join("bundles").join(name);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("app.py"), "print('hello')\n").unwrap();
        path
    }

    pub fn request(&self, name: &str) -> DeployRequest {
        DeployRequest::new(self.script_bundle(name))
    }

    pub fn routes_path(&self) -> PathBuf {
        self.dir.path().join("routes.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("apps.conf")
    }

    pub fn rendered_config(&self) -> String {
        std::fs::read_to_string(self.config_path()).unwrap_or_default()
    }

    /// Poll until `check` holds for the app or `timeout` passes.
    pub async fn wait_for<F>(&self, app: &App, timeout: Duration, check: F) -> App
    where
        F: Fn(&App) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.manager.get(app.id).await.unwrap();
            if check(&current) || tokio::time::Instant::now() >= deadline {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn build_manager(
    dir: &TempDir,
    ports: &[u16],
    gpus: Arc<StaticGpuProbe>,
    port_probe: Arc<StaticPortProbe>,
    runtime: Arc<MockRuntime>,
    reloader: Arc<MockReloader>,
    reporter: StatusReporter,
) -> Arc<AppManager> {
    let resources = Arc::new(ResourcePool::new(
        PortPool::new(ports.to_vec(), port_probe),
        Arc::new(GpuPool::new(gpus)),
    ));

    let proxy = Arc::new(ProxyConfigurator::new(
        ProxySettings {
            routes_path: dir.path().join("routes.json"),
            config_path: dir.path().join("apps.conf"),
            link_path: None,
            listen_port: 8080,
        },
        reloader,
    ));

    let store = StateStore::open(dir.path().join("agent.db")).unwrap();

    AppManager::new(
        resources,
        proxy,
        runtime,
        store,
        reporter,
        ManagerSettings {
            logs_dir: dir.path().join("logs"),
            launch: LaunchSettings::default(),
            supervise_interval: SUPERVISE_INTERVAL,
            stop_grace: Duration::from_millis(50),
            stop_timeout: Duration::from_millis(500),
        },
    )
}

/// Control plane that accepts every status push, and a reporter aimed at it.
pub async fn recording_control_plane() -> (MockServer, StatusReporter) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/update_status"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let vars = HashMap::from([("HOSTDECK_CONTROL_PLANE_URL".to_string(), server.uri())]);
    let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();
    let client = Arc::new(ControlPlaneClient::new(&config).unwrap());
    let (reporter, _worker) = StatusReporter::spawn(client, BackoffPolicy::default());
    (server, reporter)
}

/// Statuses pushed for `app`, in delivery order. Waits until at least
/// `expected` have arrived or two seconds pass.
pub async fn reported_statuses(server: &MockServer, app: AppId, expected: usize) -> Vec<AppStatus> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let statuses: Vec<AppStatus> = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(|r| serde_json::from_slice::<StatusUpdate>(&r.body).ok())
            .filter(|u| u.app_id == app)
            .map(|u| u.status)
            .collect();
        if statuses.len() >= expected || tokio::time::Instant::now() >= deadline {
            return statuses;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! App manager.
//!
//! Owns the app set and drives every lifecycle operation:
//!
//! ```text
//! deploy:  allocate -> deploying -> build -> starting -> start -> route -> running
//! stop:    stopping -> cancel supervisor -> stop runtime -> stopped -> release -> unroute
//! restart: allocate (previous port first) -> starting -> start -> route -> running
//! exit:    (supervisor) running -> stopped | error -> release -> unroute
//! ```
//!
//! Operations on one app are serialized by a per-app lock; different apps
//! proceed independently. The allocator and proxy keep their own locks,
//! which are never held across a build or start.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use hostdeck_id::AppId;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::app::{AccessPolicy, App, AppStatus, Variant};
use crate::config::Config;
use crate::error::LaunchError;
use crate::launch::{detect_variant, launcher_for, LaunchContext, LaunchSettings};
use crate::proxy::{ProxyConfigurator, RouteDescriptor};
use crate::recovery::{plan_recovery, plan_unverified, RecoveryError, RecoveryReport};
use crate::reporter::StatusReporter;
use crate::resources::{Allocation, GpuSnapshot, ResourcePool};
use crate::runtime::{append_log, CommandSpec, Liveness, Runtime};
use crate::state::{StateStore, StateStoreError};
use crate::supervisor::SupervisorSet;

/// Error recorded on apps that were mid-operation when the agent died.
pub const INTERRUPTED: &str = "interrupted by agent restart";

// =============================================================================
// Requests and settings
// =============================================================================

/// Deploy request.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    /// Caller-chosen id; minted when absent.
    #[serde(default)]
    pub app_id: Option<AppId>,

    /// Detected from the bundle when absent.
    #[serde(default)]
    pub variant: Option<Variant>,

    /// Uploaded bundle: a directory, or a file for archives.
    pub path: PathBuf,

    #[serde(default)]
    pub vram_required_mb: u64,

    #[serde(default)]
    pub allow_ips: Vec<String>,

    #[serde(default)]
    pub auth_header: Option<String>,

    #[serde(default)]
    pub container_port: Option<u16>,

    #[serde(default)]
    pub entrypoint: Option<String>,
}

impl DeployRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            app_id: None,
            variant: None,
            path: path.into(),
            vram_required_mb: 0,
            allow_ips: Vec::new(),
            auth_header: None,
            container_port: None,
            entrypoint: None,
        }
    }
}

/// Manager settings.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub logs_dir: PathBuf,
    pub launch: LaunchSettings,
    pub supervise_interval: Duration,
    pub stop_grace: Duration,
    pub stop_timeout: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            logs_dir: config.logs_dir(),
            launch: LaunchSettings {
                python: config.python.clone(),
                docker: config.docker.clone(),
                compose_port_var: config.compose_port_var.clone(),
                default_container_port: config.default_container_port,
                hf_token: config.hf_token.clone(),
            },
            supervise_interval: config.supervise_interval,
            stop_grace: config.stop_grace,
            stop_timeout: config.stop_timeout,
        }
    }
}

/// Result of an operation: the app afterwards plus non-fatal warnings.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub app: App,
    pub warnings: Vec<String>,
}

impl Outcome {
    fn new(app: App, warnings: Vec<String>) -> Self {
        Self { app, warnings }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Owner of the app set.
pub struct AppManager {
    me: Weak<AppManager>,
    apps: RwLock<HashMap<AppId, App>>,
    op_locks: Mutex<HashMap<AppId, Arc<tokio::sync::Mutex<()>>>>,
    resources: Arc<ResourcePool>,
    proxy: Arc<ProxyConfigurator>,
    runtime: Arc<dyn Runtime>,
    store: Mutex<StateStore>,
    reporter: StatusReporter,
    supervisors: SupervisorSet,
    settings: ManagerSettings,
}

impl AppManager {
    pub fn new(
        resources: Arc<ResourcePool>,
        proxy: Arc<ProxyConfigurator>,
        runtime: Arc<dyn Runtime>,
        store: StateStore,
        reporter: StatusReporter,
        settings: ManagerSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            apps: RwLock::new(HashMap::new()),
            op_locks: Mutex::new(HashMap::new()),
            resources,
            proxy,
            runtime,
            store: Mutex::new(store),
            reporter,
            supervisors: SupervisorSet::new(),
            settings,
        })
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn get(&self, app_id: AppId) -> Option<App> {
        self.apps.read().await.get(&app_id).cloned()
    }

    /// All apps, oldest first.
    pub async fn list(&self) -> Vec<App> {
        let mut apps: Vec<App> = self.apps.read().await.values().cloned().collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        apps
    }

    /// Ids of apps currently `running`.
    pub async fn running_apps(&self) -> Vec<AppId> {
        let mut ids: Vec<AppId> = self
            .apps
            .read()
            .await
            .values()
            .filter(|a| a.status == AppStatus::Running)
            .map(|a| a.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn is_supervised(&self, app_id: AppId) -> bool {
        self.supervisors.is_supervised(app_id)
    }

    pub fn supervisor_generation(&self, app_id: AppId) -> Option<u64> {
        self.supervisors.generation(app_id)
    }

    pub fn resources(&self) -> &Arc<ResourcePool> {
        &self.resources
    }

    pub fn proxy(&self) -> &Arc<ProxyConfigurator> {
        &self.proxy
    }

    pub async fn gpu_snapshot(&self) -> GpuSnapshot {
        self.resources.gpus().snapshot().await
    }

    pub fn log_path(&self, app_id: AppId) -> PathBuf {
        self.settings.logs_dir.join(format!("{app_id}.log"))
    }

    /// The app's log. Empty if nothing was written yet.
    pub async fn read_log(&self, app_id: AppId) -> Result<String, LaunchError> {
        if self.get(app_id).await.is_none() {
            return Err(LaunchError::NotFound(app_id));
        }
        match tokio::fs::read(self.log_path(app_id)).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(LaunchError::launch(app_id, format!("reading log: {e}"))),
        }
    }

    // -------------------------------------------------------------------------
    // Deploy
    // -------------------------------------------------------------------------

    /// Admit, build and start a new app.
    pub async fn deploy(&self, request: DeployRequest) -> Result<Outcome, LaunchError> {
        let access = AccessPolicy {
            allow_ips: request.allow_ips.clone(),
            auth_header: request.auth_header.clone(),
        };
        access.validate().map_err(LaunchError::InvalidRequest)?;

        if !request.path.exists() {
            return Err(LaunchError::InvalidRequest(format!(
                "bundle {} does not exist",
                request.path.display()
            )));
        }
        if let Some(entry) = &request.entrypoint {
            if entry.is_empty() || Path::new(entry).is_absolute() || entry.contains("..") {
                return Err(LaunchError::InvalidRequest(format!(
                    "entrypoint must be a relative path inside the bundle: {entry}"
                )));
            }
        }

        let variant = request
            .variant
            .unwrap_or_else(|| detect_variant(&request.path));
        let app_id = request.app_id.unwrap_or_default();

        let lock = self.op_lock(app_id);
        let _guard = lock.lock().await;

        let previous = self.get(app_id).await;
        if let Some(existing) = &previous {
            if !existing.status.is_terminal() {
                return Err(LaunchError::InvalidState {
                    app_id,
                    status: existing.status,
                    operation: "deploy",
                });
            }
        }

        let allocation = self
            .resources
            .allocate(app_id, request.vram_required_mb, None)
            .await?;

        let now = Utc::now();
        let mut app = App {
            id: app_id,
            variant,
            status: AppStatus::Deploying,
            source: request.path,
            port: Some(allocation.port),
            last_port: Some(allocation.port),
            gpus: allocation.gpus,
            vram_required_mb: request.vram_required_mb,
            access,
            container_port: request.container_port,
            entrypoint: request.entrypoint,
            artifact: None,
            handle: None,
            error: None,
            generation: previous.as_ref().map_or(0, |p| p.generation) + 1,
            created_at: previous.as_ref().map_or(now, |p| p.created_at),
            updated_at: now,
        };

        info!(
            app_id = %app_id,
            variant = %variant,
            port = allocation.port,
            gpus = ?app.gpu_indices(),
            "Deploying app"
        );
        self.log_line(app_id, &format!("==> deploy {variant} app at {now}"))
            .await;

        let steps = match self.plan_build(&app) {
            Ok(steps) => steps,
            Err(e) => return Err(self.fail_launch(app, e).await),
        };
        if steps.is_empty() {
            app.status = AppStatus::Starting;
        }
        self.commit(&app).await;

        if let Err(e) = self.build(&mut app, &steps).await {
            return Err(self.fail_launch(app, e).await);
        }

        match self.start_artifact(&mut app).await {
            Ok(warnings) => Ok(Outcome::new(app, warnings)),
            Err(e) => Err(self.fail_launch(app, e).await),
        }
    }

    /// Build steps for `app`. Empty for variants with nothing to build.
    fn plan_build(&self, app: &App) -> Result<Vec<CommandSpec>, LaunchError> {
        let gpus = app.gpu_indices();
        let port = app.port.ok_or_else(|| LaunchError::launch(app.id, "no port assigned"))?;
        launcher_for(app.variant)
            .build_steps(&self.context(app, port, &gpus))
            .map_err(|e| LaunchError::launch(app.id, e))
    }

    /// Run `steps` and record the artifact. Leaves the app in `starting`.
    async fn build(&self, app: &mut App, steps: &[CommandSpec]) -> Result<(), LaunchError> {
        let launcher = launcher_for(app.variant);
        let gpus = app.gpu_indices();
        let port = app.port.ok_or_else(|| LaunchError::launch(app.id, "no port assigned"))?;
        let log = self.log_path(app.id);

        let mut outputs = Vec::with_capacity(steps.len());
        for step in steps {
            debug!(app_id = %app.id, command = %step.display(), "Running build step");
            let output = self
                .runtime
                .run_build(app.id, step, &log)
                .await
                .map_err(|e| LaunchError::BuildFailed {
                    app_id: app.id,
                    step: step.display(),
                    output: e.to_string(),
                })?;
            outputs.push(output);
        }

        let artifact = launcher
            .artifact(&self.context(app, port, &gpus), &outputs)
            .map_err(|e| LaunchError::launch(app.id, e))?;

        app.artifact = Some(artifact);
        if app.status == AppStatus::Deploying {
            self.transition(app, AppStatus::Starting)?;
            self.commit(app).await;
        }
        Ok(())
    }

    /// Start the retained artifact, route it and arm supervision. Expects
    /// `starting` with an allocation; leaves the app `running`.
    async fn start_artifact(&self, app: &mut App) -> Result<Vec<String>, LaunchError> {
        let launcher = launcher_for(app.variant);
        let gpus = app.gpu_indices();
        let port = app.port.ok_or_else(|| LaunchError::launch(app.id, "no port assigned"))?;
        let artifact = app
            .artifact
            .clone()
            .ok_or(LaunchError::NotRestartable(app.id))?;

        let spec = launcher
            .start_spec(&self.context(app, port, &gpus), &artifact)
            .map_err(|e| LaunchError::launch(app.id, e))?;

        let handle = self
            .runtime
            .start(app.id, &spec, &self.log_path(app.id))
            .await
            .map_err(|e| LaunchError::launch(app.id, e))?;
        app.handle = Some(handle.clone());

        let route = RouteDescriptor::for_app(app)
            .ok_or_else(|| LaunchError::launch(app.id, "app has no route"))?;
        let update = self.proxy.add_route(app.id, route).await?;

        self.transition(app, AppStatus::Running)?;
        app.error = None;
        self.commit(app).await;

        self.supervisors.spawn(
            self.me.clone(),
            self.runtime.clone(),
            app.id,
            app.generation,
            handle.clone(),
            self.settings.supervise_interval,
        );

        info!(app_id = %app.id, port, handle = %handle, url = %app.url(), "App running");
        Ok(update.warning().into_iter().collect())
    }

    /// Move a failed launch to `error`, undoing everything it acquired.
    async fn fail_launch(&self, mut app: App, err: LaunchError) -> LaunchError {
        error!(app_id = %app.id, error = %err, "Launch failed");
        self.log_line(app.id, &format!("==> launch failed: {err}")).await;

        if let Some(handle) = app.handle.take() {
            if let Err(e) = self.runtime.stop(&handle, self.settings.stop_grace).await {
                warn!(app_id = %app.id, error = %e, "Failed to stop partially started workload");
            }
        }
        if let Err(e) = self.proxy.remove_route(app.id).await {
            warn!(app_id = %app.id, error = %e, "Failed to remove route of failed launch");
        }
        self.resources.release(app.id, app.port).await;

        app.port = None;
        app.gpus.clear();
        app.error = Some(err.to_string());
        if !app.transition(AppStatus::Error) {
            app.status = AppStatus::Error;
            app.updated_at = Utc::now();
        }
        self.commit(&app).await;
        err
    }

    // -------------------------------------------------------------------------
    // Stop
    // -------------------------------------------------------------------------

    /// Stop a running app. Stopping an already stopped or failed app is a
    /// no-op.
    pub async fn stop(&self, app_id: AppId) -> Result<Outcome, LaunchError> {
        let current = self
            .get(app_id)
            .await
            .ok_or(LaunchError::NotFound(app_id))?;
        if matches!(current.status, AppStatus::Deploying | AppStatus::Starting) {
            return Err(LaunchError::InvalidState {
                app_id,
                status: current.status,
                operation: "stop",
            });
        }

        let lock = self.op_lock(app_id);
        let _guard = lock.lock().await;

        let mut app = self
            .get(app_id)
            .await
            .ok_or(LaunchError::NotFound(app_id))?;
        if app.status.is_terminal() {
            return Ok(Outcome::new(app, Vec::new()));
        }
        if app.status != AppStatus::Running {
            return Err(LaunchError::InvalidState {
                app_id,
                status: app.status,
                operation: "stop",
            });
        }

        let warnings = self.stop_locked(&mut app).await;
        Ok(Outcome::new(app, warnings))
    }

    /// Stop with the op lock held. Always ends in `stopped`.
    async fn stop_locked(&self, app: &mut App) -> Vec<String> {
        info!(app_id = %app.id, "Stopping app");
        if !app.transition(AppStatus::Stopping) {
            app.status = AppStatus::Stopping;
        }
        self.commit(app).await;
        self.supervisors.cancel(app.id);

        if let Some(handle) = app.handle.clone() {
            let log = self.log_path(app.id);
            if let Err(e) = self.runtime.capture_output(&handle, &log).await {
                debug!(app_id = %app.id, error = %e, "Could not capture workload output");
            }

            let stop = self.runtime.stop(&handle, self.settings.stop_grace);
            match tokio::time::timeout(self.settings.stop_timeout, stop).await {
                Ok(Ok(())) => debug!(app_id = %app.id, handle = %handle, "Workload stopped"),
                Ok(Err(e)) => {
                    warn!(app_id = %app.id, error = %e, "Stop failed, marking stopped anyway")
                }
                Err(_) => warn!(
                    app_id = %app.id,
                    timeout_secs = self.settings.stop_timeout.as_secs(),
                    "Stop timed out, marking stopped anyway"
                ),
            }
        }

        app.handle = None;
        app.transition(AppStatus::Stopped);

        self.resources.release(app.id, app.port).await;
        app.port = None;
        app.gpus.clear();

        let mut warnings = Vec::new();
        match self.proxy.remove_route(app.id).await {
            Ok(update) => warnings.extend(update.warning()),
            Err(e) => {
                warn!(app_id = %app.id, error = %e, "Failed to remove route");
                warnings.push(format!("route removal failed: {e}"));
            }
        }

        self.commit(app).await;
        info!(app_id = %app.id, "App stopped");
        warnings
    }

    // -------------------------------------------------------------------------
    // Restart
    // -------------------------------------------------------------------------

    /// Start a stopped or failed app from its retained artifact.
    pub async fn restart(&self, app_id: AppId) -> Result<Outcome, LaunchError> {
        let lock = self.op_lock(app_id);
        let _guard = lock.lock().await;

        let mut app = self
            .get(app_id)
            .await
            .ok_or(LaunchError::NotFound(app_id))?;
        if !app.status.is_terminal() {
            return Err(LaunchError::InvalidState {
                app_id,
                status: app.status,
                operation: "restart",
            });
        }

        let artifact = app
            .artifact
            .clone()
            .ok_or(LaunchError::NotRestartable(app_id))?;
        match self.runtime.artifact_present(&artifact).await {
            Ok(true) => {}
            Ok(false) => return Err(LaunchError::NotRestartable(app_id)),
            Err(e) => return Err(LaunchError::launch(app_id, e)),
        }

        let allocation = self
            .resources
            .allocate(app_id, app.vram_required_mb, app.last_port)
            .await?;

        app.port = Some(allocation.port);
        app.last_port = Some(allocation.port);
        app.gpus = allocation.gpus;
        app.generation += 1;
        app.error = None;
        self.transition(&mut app, AppStatus::Starting)?;

        info!(app_id = %app_id, port = allocation.port, "Restarting app");
        self.log_line(app_id, &format!("==> restart at {}", Utc::now()))
            .await;
        self.commit(&app).await;

        match self.start_artifact(&mut app).await {
            Ok(warnings) => Ok(Outcome::new(app, warnings)),
            Err(e) => Err(self.fail_launch(app, e).await),
        }
    }

    // -------------------------------------------------------------------------
    // Delete
    // -------------------------------------------------------------------------

    /// Remove an app entirely, force-stopping it first if needed.
    pub async fn delete(&self, app_id: AppId) -> Result<Vec<String>, LaunchError> {
        let current = self
            .get(app_id)
            .await
            .ok_or(LaunchError::NotFound(app_id))?;
        if current.status == AppStatus::Deploying {
            return Err(LaunchError::InvalidState {
                app_id,
                status: current.status,
                operation: "delete",
            });
        }

        let lock = self.op_lock(app_id);
        let _guard = lock.lock().await;

        let mut app = self
            .get(app_id)
            .await
            .ok_or(LaunchError::NotFound(app_id))?;
        if app.status == AppStatus::Deploying {
            return Err(LaunchError::InvalidState {
                app_id,
                status: app.status,
                operation: "delete",
            });
        }

        let mut warnings = Vec::new();
        if !app.status.is_terminal() {
            warnings.extend(self.stop_locked(&mut app).await);
        }
        self.supervisors.cancel(app_id);

        match self.proxy.remove_route(app_id).await {
            Ok(update) => warnings.extend(update.warning()),
            Err(e) => warnings.push(format!("route removal failed: {e}")),
        }
        self.resources.release(app_id, app.port).await;

        if let Some(artifact) = &app.artifact {
            if let Err(e) = self.runtime.remove_artifact(artifact).await {
                warn!(app_id = %app_id, error = %e, "Failed to remove artifact");
                warnings.push(format!("artifact removal failed: {e}"));
            }
        }

        match tokio::fs::remove_file(self.log_path(app_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(app_id = %app_id, error = %e, "Failed to remove app log"),
        }

        self.with_store(|store| store.delete_app(app_id))?;
        self.apps.write().await.remove(&app_id);
        if let Ok(mut locks) = self.op_locks.lock() {
            locks.remove(&app_id);
        }

        info!(app_id = %app_id, "App deleted");
        Ok(warnings)
    }

    // -------------------------------------------------------------------------
    // Supervision callback
    // -------------------------------------------------------------------------

    /// Handle a workload that died while `running`. Ignored if the app has
    /// since moved on (stopped, restarted under a new generation).
    pub(crate) async fn on_runtime_exit(&self, app_id: AppId, generation: u64, liveness: Liveness) {
        let lock = self.op_lock(app_id);
        let _guard = lock.lock().await;
        self.supervisors.finish(app_id, generation);

        let Some(mut app) = self.get(app_id).await else {
            return;
        };
        if app.status != AppStatus::Running || app.generation != generation {
            debug!(app_id = %app_id, generation, "Ignoring exit of superseded workload");
            return;
        }

        if let Some(handle) = app.handle.take() {
            if let Err(e) = self
                .runtime
                .capture_output(&handle, &self.log_path(app_id))
                .await
            {
                debug!(app_id = %app_id, error = %e, "Could not capture workload output");
            }
            // Clears leftovers such as an exited container.
            let cleanup = self.runtime.stop(&handle, Duration::ZERO);
            match tokio::time::timeout(self.settings.stop_timeout, cleanup).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(app_id = %app_id, error = %e, "Cleanup of exited workload failed")
                }
                Err(_) => debug!(app_id = %app_id, "Cleanup of exited workload timed out"),
            }
        }

        match liveness {
            Liveness::Exited { code: Some(0) } => {
                app.transition(AppStatus::Stopped);
                info!(app_id = %app_id, "App exited cleanly");
            }
            other => {
                let reason = match other {
                    Liveness::Exited { code: Some(code) } => format!("exited with code {code}"),
                    Liveness::Exited { code: None } => "exited unexpectedly".to_string(),
                    _ => "runtime disappeared".to_string(),
                };
                app.transition(AppStatus::Error);
                app.error = Some(reason.clone());
                warn!(app_id = %app_id, reason = %reason, "App crashed");
                self.log_line(app_id, &format!("==> {reason}")).await;
            }
        }

        self.resources.release(app_id, app.port).await;
        app.port = None;
        app.gpus.clear();

        if let Err(e) = self.proxy.remove_route(app_id).await {
            warn!(app_id = %app_id, error = %e, "Failed to remove route of exited app");
        }
        self.commit(&app).await;
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Rebuild the app set from the routes file and the live runtimes.
    ///
    /// Runs before the API is served. Only an unreadable routes file (or an
    /// unusable store) is fatal; stale routes are dropped and unknown
    /// workloads are left alone. If the runtime cannot list its workloads,
    /// every declared route is kept and supervision settles which are dead.
    /// Running it again without intervening changes yields the same apps
    /// and routes.
    pub async fn recover(&self) -> Result<RecoveryReport, RecoveryError> {
        let declared = self.proxy.load_declared().map_err(RecoveryError::Routes)?;

        let stored: HashMap<AppId, App> = {
            let store = self.store.lock().map_err(|_| StateStoreError::Poisoned)?;
            store.list_apps()?.into_iter().map(|a| (a.id, a)).collect()
        };

        let mut unverified = None;
        let plan = match self.runtime.list_live().await {
            Ok(observed) => plan_recovery(declared, observed),
            Err(e) => {
                warn!(error = %e, "Could not enumerate live workloads, keeping declared routes");
                unverified = Some(format!(
                    "live workloads could not be listed ({e}); declared routes kept pending supervision"
                ));
                plan_unverified(declared)
            }
        };
        let mut report = RecoveryReport {
            dropped: plan.dropped.clone(),
            unmanaged: plan.unmanaged.iter().map(|o| o.handle.clone()).collect(),
            warnings: unverified.into_iter().collect(),
            ..RecoveryReport::default()
        };

        let mut routes = BTreeMap::new();
        for adoption in plan.adopt {
            let app_id = adoption.app_id;
            let route = adoption.route;

            let allocation = Allocation {
                port: route.port,
                gpus: route.gpus.clone(),
            };
            if let Err(e) = self.resources.restore(app_id, &allocation).await {
                warn!(app_id = %app_id, error = %e, "Cannot re-register allocation, dropping route");
                report.dropped.push(app_id);
                continue;
            }

            let existing = self.get(app_id).await;
            let already_adopted = existing.as_ref().is_some_and(|a| {
                a.status == AppStatus::Running
                    && a.handle.as_ref() == Some(&route.handle)
                    && self.supervisors.generation(app_id) == Some(a.generation)
            });

            if !already_adopted {
                let base = existing.or_else(|| stored.get(&app_id).cloned());
                let app = adopted_app(app_id, &route, base);
                self.commit(&app).await;
                self.supervisors.spawn(
                    self.me.clone(),
                    self.runtime.clone(),
                    app_id,
                    app.generation,
                    route.handle.clone(),
                    self.settings.supervise_interval,
                );
                info!(app_id = %app_id, port = route.port, handle = %route.handle, "Adopted running app");
            }

            report.adopted.push(app_id);
            routes.insert(app_id, route);
        }

        let update = self
            .proxy
            .replace_all(routes.clone())
            .await
            .map_err(RecoveryError::Routes)?;
        if let Some(warning) = update.warning() {
            warn!(warning = %warning, "Recovered routes written but proxy not reloaded");
            report.warnings.push(warning);
        }

        // Everything not adopted: terminal records load as-is, anything
        // caught mid-flight becomes an error.
        let in_memory: Vec<App> = self.apps.read().await.values().cloned().collect();
        let mut candidates: HashMap<AppId, App> = stored;
        for app in in_memory {
            candidates.insert(app.id, app);
        }

        for (app_id, mut app) in candidates {
            if routes.contains_key(&app_id) {
                continue;
            }
            if app.status.is_terminal() {
                self.apps.write().await.entry(app_id).or_insert(app);
                continue;
            }

            self.supervisors.cancel(app_id);
            self.resources.release(app_id, app.port).await;
            app.status = AppStatus::Error;
            app.error = Some(INTERRUPTED.to_string());
            app.port = None;
            app.gpus.clear();
            app.handle = None;
            app.updated_at = Utc::now();
            self.commit(&app).await;
            report.interrupted.push(app_id);
        }

        report.adopted.sort();
        report.dropped.sort();
        report.interrupted.sort();

        info!(
            adopted = report.adopted.len(),
            dropped = report.dropped.len(),
            unmanaged = report.unmanaged.len(),
            interrupted = report.interrupted.len(),
            "Recovery complete"
        );
        for app_id in &report.dropped {
            info!(app_id = %app_id, "Dropped stale route with no live workload");
        }

        Ok(report)
    }

    /// Cancel all supervision (agent shutdown). Workloads keep running so
    /// the next start can adopt them.
    pub fn shutdown(&self) {
        let count = self.supervisors.len();
        self.supervisors.cancel_all();
        info!(supervisors = count, "Supervision cancelled, workloads left running");
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn op_lock(&self, app_id: AppId) -> Arc<tokio::sync::Mutex<()>> {
        match self.op_locks.lock() {
            Ok(mut locks) => locks.entry(app_id).or_default().clone(),
            // Poisoned map: fall back to an unshared lock rather than panic.
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn context<'a>(&'a self, app: &'a App, port: u16, gpus: &'a [u32]) -> LaunchContext<'a> {
        LaunchContext {
            app,
            port,
            gpus,
            settings: &self.settings.launch,
        }
    }

    fn transition(&self, app: &mut App, next: AppStatus) -> Result<(), LaunchError> {
        let from = app.status;
        if !app.transition(next) {
            return Err(LaunchError::InvalidState {
                app_id: app.id,
                status: from,
                operation: "transition",
            });
        }
        debug!(app_id = %app.id, from = %from, to = %next, "Status transition");
        Ok(())
    }

    /// Publish `app`: in-memory set, local store, control plane.
    async fn commit(&self, app: &App) {
        self.apps.write().await.insert(app.id, app.clone());

        if let Err(e) = self.with_store(|store| store.upsert_app(app)) {
            warn!(app_id = %app.id, error = %e, "Failed to persist app record");
        }

        info!(app_id = %app.id, status = %app.status, "App status");
        self.reporter.report(app);
    }

    fn with_store<T>(
        &self,
        f: impl FnOnce(&StateStore) -> Result<T, StateStoreError>,
    ) -> Result<T, LaunchError> {
        let store = self.store.lock().map_err(|_| StateStoreError::Poisoned)?;
        Ok(f(&store)?)
    }

    async fn log_line(&self, app_id: AppId, line: &str) {
        if let Err(e) = append_log(&self.log_path(app_id), line).await {
            debug!(app_id = %app_id, error = %e, "Failed to write app log");
        }
    }
}

/// App record for an adopted workload. Keeps what the store knew (source,
/// artifact, creation time) and takes allocation and handle from the route.
fn adopted_app(app_id: AppId, route: &RouteDescriptor, base: Option<App>) -> App {
    let now = Utc::now();
    let mut app = base.unwrap_or_else(|| App {
        id: app_id,
        variant: route.variant,
        status: AppStatus::Running,
        source: PathBuf::new(),
        port: None,
        last_port: None,
        gpus: Vec::new(),
        vram_required_mb: route.vram_required_mb,
        access: route.access.clone(),
        container_port: None,
        entrypoint: None,
        artifact: None,
        handle: None,
        error: None,
        generation: 0,
        created_at: now,
        updated_at: now,
    });

    app.status = AppStatus::Running;
    app.variant = route.variant;
    app.port = Some(route.port);
    app.last_port = Some(route.port);
    app.gpus = route.gpus.clone();
    app.vram_required_mb = route.vram_required_mb;
    app.access = route.access.clone();
    app.handle = Some(route.handle.clone());
    app.error = None;
    app.generation += 1;
    app.updated_at = now;
    app
}

//! In-memory runtime for tests and development.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hostdeck_id::AppId;
use tracing::{debug, info};

use super::{
    append_log, compose_project, container_name, Artifact, CommandSpec, Liveness,
    ObservedRuntime, Runtime, RuntimeError, RuntimeHandle, StartSpec,
};

#[derive(Debug, Clone)]
struct MockWorkload {
    app_id: AppId,
    liveness: Liveness,
}

/// Mock runtime.
///
/// Workloads live in a map keyed by handle; tests drive them with
/// [`MockRuntime::crash`] and [`MockRuntime::exit`]. Sharing one instance
/// between two agents simulates an agent restart with workloads that kept
/// running.
pub struct MockRuntime {
    /// Counter for generating pids.
    next_pid: AtomicU32,

    workloads: Mutex<BTreeMap<RuntimeHandle, MockWorkload>>,

    /// Every build step run, in order.
    builds: Mutex<Vec<(AppId, CommandSpec)>>,

    /// Every start, in order.
    starts: Mutex<Vec<(AppId, StartSpec)>>,

    /// Artifacts removed from the host.
    removed: Mutex<HashSet<String>>,

    fail_builds: AtomicBool,
    fail_starts: AtomicBool,
    fail_listing: AtomicBool,

    /// Whether workloads ignore graceful stop (stop then hangs).
    hang_on_stop: AtomicBool,

    /// Canned output returned by every build step.
    build_output: Mutex<String>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            workloads: Mutex::new(BTreeMap::new()),
            builds: Mutex::new(Vec::new()),
            starts: Mutex::new(Vec::new()),
            removed: Mutex::new(HashSet::new()),
            fail_builds: AtomicBool::new(false),
            fail_starts: AtomicBool::new(false),
            fail_listing: AtomicBool::new(false),
            hang_on_stop: AtomicBool::new(false),
            build_output: Mutex::new(String::new()),
        }
    }

    /// Create a mock runtime that fails all starts.
    pub fn failing() -> Self {
        let runtime = Self::new();
        runtime.set_fail_starts(true);
        runtime
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    /// Make `list_live` fail, as when the container engine is down.
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn set_hang_on_stop(&self, hang: bool) {
        self.hang_on_stop.store(hang, Ordering::SeqCst);
    }

    pub fn set_build_output(&self, output: &str) {
        if let Ok(mut out) = self.build_output.lock() {
            *out = output.to_string();
        }
    }

    /// Make every workload of `app` exit with `code`.
    pub fn exit(&self, app: AppId, code: i32) {
        self.set_liveness(app, Liveness::Exited { code: Some(code) });
    }

    /// Make every workload of `app` exit non-zero.
    pub fn crash(&self, app: AppId) {
        self.exit(app, 1);
    }

    /// Make every workload of `app` vanish.
    pub fn vanish(&self, app: AppId) {
        if let Ok(mut workloads) = self.workloads.lock() {
            workloads.retain(|_, w| w.app_id != app);
        }
    }

    /// Register a workload started outside the agent.
    pub fn spawn_external(&self, app: AppId, handle: RuntimeHandle) {
        if let Ok(mut workloads) = self.workloads.lock() {
            workloads.insert(
                handle,
                MockWorkload {
                    app_id: app,
                    liveness: Liveness::Running,
                },
            );
        }
    }

    pub fn is_running(&self, app: AppId) -> bool {
        self.workloads
            .lock()
            .map(|w| {
                w.values()
                    .any(|w| w.app_id == app && w.liveness == Liveness::Running)
            })
            .unwrap_or(false)
    }

    pub fn builds(&self) -> Vec<(AppId, CommandSpec)> {
        self.builds.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn starts(&self) -> Vec<(AppId, StartSpec)> {
        self.starts.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn set_liveness(&self, app: AppId, liveness: Liveness) {
        if let Ok(mut workloads) = self.workloads.lock() {
            for w in workloads.values_mut().filter(|w| w.app_id == app) {
                w.liveness = liveness;
            }
        }
    }

    fn artifact_key(artifact: &Artifact) -> String {
        match artifact {
            Artifact::Environment { venv, .. } => format!("venv:{}", venv.display()),
            Artifact::Script { entry, .. } => format!("script:{}", entry.display()),
            Artifact::Image { reference } => format!("image:{reference}"),
            Artifact::Compose { project, .. } => format!("compose:{project}"),
        }
    }

    fn handle_for(&self, app: AppId, spec: &StartSpec) -> RuntimeHandle {
        match spec {
            StartSpec::Process(_) => RuntimeHandle::Process {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            },
            StartSpec::Container { .. } => RuntimeHandle::Container {
                name: container_name(app),
            },
            StartSpec::Compose { dir, .. } => RuntimeHandle::Compose {
                project: compose_project(app),
                dir: dir.clone(),
            },
        }
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn run_build(
        &self,
        app: AppId,
        step: &CommandSpec,
        log: &Path,
    ) -> Result<String, RuntimeError> {
        info!(app_id = %app, command = %step.display(), "[MOCK] Running build step");
        if let Ok(mut builds) = self.builds.lock() {
            builds.push((app, step.clone()));
        }

        let output = self.build_output.lock().map(|o| o.clone()).unwrap_or_default();
        append_log(log, &format!("$ {}\n{output}", step.display())).await?;

        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed {
                command: step.display(),
                status: "exit 1".to_string(),
                output: "mock build failure".to_string(),
            });
        }

        Ok(output)
    }

    async fn start(
        &self,
        app: AppId,
        spec: &StartSpec,
        _log: &Path,
    ) -> Result<RuntimeHandle, RuntimeError> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other(
                "Mock runtime configured to fail".to_string(),
            ));
        }

        if let Ok(mut starts) = self.starts.lock() {
            starts.push((app, spec.clone()));
        }

        let handle = self.handle_for(app, spec);
        self.spawn_external(app, handle.clone());
        debug!(app_id = %app, handle = %handle, "[MOCK] Workload started");
        Ok(handle)
    }

    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> Result<(), RuntimeError> {
        if self.hang_on_stop.load(Ordering::SeqCst) {
            tokio::time::sleep(grace + Duration::from_secs(3600)).await;
        }

        if let Ok(mut workloads) = self.workloads.lock() {
            workloads.remove(handle);
        }
        debug!(handle = %handle, "[MOCK] Workload stopped");
        Ok(())
    }

    async fn liveness(&self, handle: &RuntimeHandle) -> Result<Liveness, RuntimeError> {
        Ok(self
            .workloads
            .lock()
            .ok()
            .and_then(|w| w.get(handle).map(|w| w.liveness))
            .unwrap_or(Liveness::Missing))
    }

    async fn capture_output(&self, handle: &RuntimeHandle, log: &Path) -> Result<(), RuntimeError> {
        append_log(log, &format!("[mock output for {handle}]")).await
    }

    async fn list_live(&self) -> Result<Vec<ObservedRuntime>, RuntimeError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other(
                "Mock runtime configured to fail listing".to_string(),
            ));
        }
        Ok(self
            .workloads
            .lock()
            .map(|w| {
                w.iter()
                    .filter(|(_, w)| w.liveness == Liveness::Running)
                    .map(|(handle, w)| ObservedRuntime {
                        app_id: Some(w.app_id),
                        handle: handle.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn artifact_present(&self, artifact: &Artifact) -> Result<bool, RuntimeError> {
        Ok(!self
            .removed
            .lock()
            .map(|r| r.contains(&Self::artifact_key(artifact)))
            .unwrap_or(false))
    }

    async fn remove_artifact(&self, artifact: &Artifact) -> Result<(), RuntimeError> {
        if let Ok(mut removed) = self.removed.lock() {
            removed.insert(Self::artifact_key(artifact));
        }
        Ok(())
    }
}

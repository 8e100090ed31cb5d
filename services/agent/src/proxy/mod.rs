//! Proxy configurator.
//!
//! Sole owner of the route table, the routes file and the generated nginx
//! configuration. Every mutation goes through [`ProxyConfigurator`], which:
//! 1. updates the in-memory table
//! 2. persists the table (temp file + rename)
//! 3. regenerates the whole configuration and replaces it atomically
//! 4. asks the proxy to reload
//!
//! Steps run under one lock so concurrent calls never interleave writes.
//! A failed reload leaves the table updated and is reported as
//! [`ReloadOutcome::Degraded`], never as an error.

mod persistence;
mod render;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hostdeck_id::AppId;
use hostdeck_reconcile::ContentHash;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::app::{AccessPolicy, App, Variant};
use crate::resources::GpuShare;
use crate::runtime::{run_command, CommandSpec, RuntimeHandle};

pub use persistence::RoutePersistence;
pub use render::render;

/// Upper bound on one reload command.
const RELOAD_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Types
// =============================================================================

/// One route: where an app is served and enough to rebuild it on recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    pub port: u16,
    #[serde(default)]
    pub access: AccessPolicy,
    pub variant: Variant,
    #[serde(default)]
    pub gpus: Vec<GpuShare>,
    #[serde(default)]
    pub vram_required_mb: u64,
    pub handle: RuntimeHandle,
}

impl RouteDescriptor {
    /// Descriptor for a running app. `None` if the app has no port or handle.
    pub fn for_app(app: &App) -> Option<Self> {
        Some(Self {
            port: app.port?,
            access: app.access.clone(),
            variant: app.variant,
            gpus: app.gpus.clone(),
            vram_required_mb: app.vram_required_mb,
            handle: app.handle.clone()?,
        })
    }
}

/// Result of asking the proxy to pick up new configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Configuration written and reloaded.
    Applied,
    /// Configuration written, reload failed. The route is recorded but not
    /// yet externally active.
    Degraded(String),
    /// Generated configuration identical to the last applied one.
    Unchanged,
}

/// Outcome of a route table mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUpdate {
    pub reload: ReloadOutcome,
}

impl RouteUpdate {
    /// Non-fatal warning to surface to the caller, if any.
    pub fn warning(&self) -> Option<String> {
        match &self.reload {
            ReloadOutcome::Degraded(reason) => Some(format!("proxy reload degraded: {reason}")),
            _ => None,
        }
    }
}

/// Proxy configurator errors.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid route for {app_id}: {reason}")]
    Render { app_id: AppId, reason: String },

    #[error("routes file {path} is unusable: {reason}")]
    Persist { path: PathBuf, reason: String },
}

/// File locations and listen port for the generated configuration.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub routes_path: PathBuf,
    pub config_path: PathBuf,
    pub link_path: Option<PathBuf>,
    pub listen_port: u16,
}

// =============================================================================
// Reload trigger
// =============================================================================

/// Makes the external proxy re-read its configuration.
#[async_trait]
pub trait ProxyReloader: Send + Sync {
    async fn reload(&self) -> anyhow::Result<()>;
}

/// Runs a configured command, e.g. `nginx -s reload`.
pub struct CommandReloader {
    command: CommandSpec,
}

impl CommandReloader {
    pub fn new(command: &[String]) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("reload command is empty"))?;
        Ok(Self {
            command: CommandSpec::new(program).args(args.iter().cloned()),
        })
    }
}

#[async_trait]
impl ProxyReloader for CommandReloader {
    async fn reload(&self) -> anyhow::Result<()> {
        run_command(&self.command, RELOAD_TIMEOUT)
            .await?
            .check(&self.command)?;
        Ok(())
    }
}

/// Reloader for tests: counts reloads and can be told to fail.
#[derive(Debug, Default)]
pub struct MockReloader {
    reloads: AtomicUsize,
    failing: AtomicBool,
}

impl MockReloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyReloader for MockReloader {
    async fn reload(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("mock reload failure");
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Configurator
// =============================================================================

#[derive(Default)]
struct ProxyState {
    routes: BTreeMap<AppId, RouteDescriptor>,

    /// Hash of the configuration the proxy last reloaded successfully.
    applied: Option<ContentHash>,
}

/// Owner of the route table and the generated configuration.
pub struct ProxyConfigurator {
    state: Mutex<ProxyState>,
    persistence: RoutePersistence,
    settings: ProxySettings,
    reloader: Arc<dyn ProxyReloader>,
}

impl ProxyConfigurator {
    /// Create a configurator with an empty in-memory table. Call
    /// [`Self::replace_all`] (recovery) to take over what is on disk.
    pub fn new(settings: ProxySettings, reloader: Arc<dyn ProxyReloader>) -> Self {
        Self {
            state: Mutex::new(ProxyState::default()),
            persistence: RoutePersistence::new(settings.routes_path.clone()),
            settings,
            reloader,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.settings.config_path
    }

    /// Routes as last written to disk; the declared intent read by recovery.
    pub fn load_declared(&self) -> Result<BTreeMap<AppId, RouteDescriptor>, ProxyError> {
        self.persistence.load()
    }

    /// Snapshot of the in-memory table.
    pub async fn routes(&self) -> BTreeMap<AppId, RouteDescriptor> {
        self.state.lock().await.routes.clone()
    }

    pub async fn contains(&self, app_id: AppId) -> bool {
        self.state.lock().await.routes.contains_key(&app_id)
    }

    /// Add or replace the route for `app_id`.
    pub async fn add_route(
        &self,
        app_id: AppId,
        route: RouteDescriptor,
    ) -> Result<RouteUpdate, ProxyError> {
        if let Err(reason) = route.access.validate() {
            return Err(ProxyError::Render { app_id, reason });
        }

        let mut state = self.state.lock().await;
        let previous = state.routes.insert(app_id, route.clone());

        match self.apply(&mut state).await {
            Ok(update) => {
                info!(app_id = %app_id, port = route.port, "Route added");
                Ok(update)
            }
            Err(e) => {
                match previous {
                    Some(previous) => state.routes.insert(app_id, previous),
                    None => state.routes.remove(&app_id),
                };
                self.resave(&state.routes);
                Err(e)
            }
        }
    }

    /// Remove the route for `app_id`. Removing an absent route is a no-op.
    pub async fn remove_route(&self, app_id: AppId) -> Result<RouteUpdate, ProxyError> {
        let mut state = self.state.lock().await;
        let Some(previous) = state.routes.remove(&app_id) else {
            return Ok(RouteUpdate {
                reload: ReloadOutcome::Unchanged,
            });
        };

        match self.apply(&mut state).await {
            Ok(update) => {
                info!(app_id = %app_id, port = previous.port, "Route removed");
                Ok(update)
            }
            Err(e) => {
                state.routes.insert(app_id, previous);
                self.resave(&state.routes);
                Err(e)
            }
        }
    }

    /// Replace the whole table (recovery).
    pub async fn replace_all(
        &self,
        routes: BTreeMap<AppId, RouteDescriptor>,
    ) -> Result<RouteUpdate, ProxyError> {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut state.routes, routes);

        match self.apply(&mut state).await {
            Ok(update) => Ok(update),
            Err(e) => {
                state.routes = previous;
                self.resave(&state.routes);
                Err(e)
            }
        }
    }

    /// Put the rolled-back table back on disk after a failed apply.
    fn resave(&self, routes: &BTreeMap<AppId, RouteDescriptor>) {
        if let Err(e) = self.persistence.save(routes) {
            warn!(error = %e, "Failed to restore routes file after a failed update");
        }
    }

    /// Persist, regenerate and reload. Caller holds the state lock and, on
    /// error, rolls the table back and calls [`Self::resave`].
    async fn apply(&self, state: &mut ProxyState) -> Result<RouteUpdate, ProxyError> {
        self.persistence.save(&state.routes)?;

        let config = render(&state.routes, self.settings.listen_port);
        let hash = ContentHash::of_bytes(config.as_bytes());
        if state.applied.as_ref() == Some(&hash) && self.settings.config_path.exists() {
            debug!(hash = %hash, "Proxy configuration unchanged");
            return Ok(RouteUpdate {
                reload: ReloadOutcome::Unchanged,
            });
        }

        persistence::write_atomic(&self.settings.config_path, config.as_bytes())?;
        self.ensure_link();

        let reload = match self.reloader.reload().await {
            Ok(()) => {
                state.applied = Some(hash.clone());
                debug!(hash = %hash, route_count = state.routes.len(), "Proxy reloaded");
                ReloadOutcome::Applied
            }
            Err(e) => {
                // Not recorded as applied, so the next change retries.
                state.applied = None;
                warn!(error = %e, "Proxy reload failed, configuration written but not active");
                ReloadOutcome::Degraded(e.to_string())
            }
        };

        Ok(RouteUpdate { reload })
    }

    /// Link the generated file into the proxy's auto-load directory. On
    /// failure the proxy must be pointed at `config_path` directly.
    fn ensure_link(&self) {
        let Some(link) = &self.settings.link_path else {
            return;
        };
        let target = &self.settings.config_path;
        if link == target {
            return;
        }

        if let Ok(current) = std::fs::read_link(link) {
            if &current == target {
                return;
            }
        }

        let result = (|| -> std::io::Result<()> {
            if link.symlink_metadata().is_ok() {
                std::fs::remove_file(link)?;
            }
            std::os::unix::fs::symlink(target, link)
        })();

        match result {
            Ok(()) => info!(link = %link.display(), target = %target.display(), "Linked proxy configuration"),
            Err(e) => warn!(
                link = %link.display(),
                target = %target.display(),
                error = %e,
                "Could not link proxy configuration, proxy must include the target path directly"
            ),
        }
    }
}

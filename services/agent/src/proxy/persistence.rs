//! Route table persistence.
//!
//! The routes file is the declared intent read back by recovery:
//! - written to a temp file and renamed, so a crash never leaves half a table
//! - a missing file is an empty table (first start)
//! - an unreadable or unparseable file is an error, which aborts recovery

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use hostdeck_id::AppId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ProxyError, RouteDescriptor};

/// Persisted route table format version.
const ROUTES_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRoutes {
    version: u32,
    routes: BTreeMap<AppId, RouteDescriptor>,
}

/// Reads and writes the routes file.
pub struct RoutePersistence {
    path: PathBuf,
}

impl RoutePersistence {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted table.
    pub fn load(&self) -> Result<BTreeMap<AppId, RouteDescriptor>, ProxyError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No routes file, starting empty");
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(&self.path).map_err(|e| ProxyError::Io {
            path: self.path.clone(),
            source: e,
        })?;

        let state: PersistedRoutes =
            serde_json::from_str(&content).map_err(|e| ProxyError::Persist {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if state.version != ROUTES_VERSION {
            return Err(ProxyError::Persist {
                path: self.path.clone(),
                reason: format!(
                    "unsupported version {} (expected {ROUTES_VERSION})",
                    state.version
                ),
            });
        }

        info!(
            path = %self.path.display(),
            route_count = state.routes.len(),
            "Loaded routes from disk"
        );

        Ok(state.routes)
    }

    /// Replace the persisted table atomically.
    pub fn save(&self, routes: &BTreeMap<AppId, RouteDescriptor>) -> Result<(), ProxyError> {
        let state = PersistedRoutes {
            version: ROUTES_VERSION,
            routes: routes.clone(),
        };
        let content = serde_json::to_string_pretty(&state).map_err(|e| ProxyError::Persist {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        write_atomic(&self.path, content.as_bytes())?;

        debug!(
            path = %self.path.display(),
            route_count = routes.len(),
            "Saved routes to disk"
        );
        Ok(())
    }
}

/// Write `content` to `path` through a temp file and rename.
pub(super) fn write_atomic(path: &Path, content: &[u8]) -> Result<(), ProxyError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ProxyError::Io { path, source }
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content).map_err(io_err(&tmp_path))?;
    fs::rename(&tmp_path, path).map_err(io_err(path))?;
    Ok(())
}

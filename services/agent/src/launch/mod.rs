//! Variant-specific launch strategies.
//!
//! Each variant turns an app plus its allocation into build steps (run
//! while the app is `deploying`), the artifact those steps leave behind, and
//! the start plan for that artifact. Restart only calls
//! [`VariantLauncher::start_spec`] with the retained artifact.

mod archive;
mod compose;
mod image;
mod script;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::app::{App, Variant};
use crate::runtime::{Artifact, CommandSpec, StartSpec};

pub use archive::{parse_loaded_image, ArchiveLauncher};
pub use compose::ComposeLauncher;
pub use image::{parse_exposed_port, ImageLauncher};
pub use script::{resolve_entry_script, ScriptLauncher};

/// File names recognised as compose definitions, in preference order.
pub const COMPOSE_FILES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

/// How deep bundle searches descend.
const SEARCH_DEPTH: usize = 4;

/// Host-wide launch settings.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub python: String,
    pub docker: String,
    pub compose_port_var: String,
    pub default_container_port: u16,
    pub hf_token: Option<String>,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            docker: "docker".to_string(),
            compose_port_var: "APP_PORT".to_string(),
            default_container_port: 7860,
            hf_token: None,
        }
    }
}

/// Inputs for one launch.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    pub app: &'a App,
    pub port: u16,
    pub gpus: &'a [u32],
    pub settings: &'a LaunchSettings,
}

impl LaunchContext<'_> {
    /// `CUDA_VISIBLE_DEVICES` value, if any GPU was allocated.
    pub fn visible_devices(&self) -> Option<String> {
        if self.gpus.is_empty() {
            return None;
        }
        Some(
            self.gpus
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Credential passthrough, if configured.
    pub fn credential_env(&self) -> Option<(String, String)> {
        self.settings
            .hf_token
            .as_ref()
            .map(|token| ("HF_TOKEN".to_string(), token.clone()))
    }
}

/// Launch planning failures.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no python entry script found in {0}")]
    NoEntryScript(PathBuf),

    #[error("entry script {0} does not exist")]
    MissingEntryScript(PathBuf),

    #[error("no Dockerfile found in {0}")]
    NoBuildFile(PathBuf),

    #[error("no compose file found in {0}")]
    NoComposeFile(PathBuf),

    #[error("could not determine the image loaded from the archive")]
    UnknownLoadedImage,

    #[error("retained artifact does not belong to a {0} app")]
    ArtifactMismatch(Variant),
}

/// One launch strategy per variant.
pub trait VariantLauncher: Send + Sync {
    /// Steps run while `deploying`. Empty means the variant goes straight to
    /// `starting`.
    fn build_steps(&self, ctx: &LaunchContext<'_>) -> Result<Vec<CommandSpec>, PlanError>;

    /// Artifact left by the build steps, given each step's output.
    fn artifact(&self, ctx: &LaunchContext<'_>, outputs: &[String]) -> Result<Artifact, PlanError>;

    /// How to start the artifact with this allocation.
    fn start_spec(&self, ctx: &LaunchContext<'_>, artifact: &Artifact)
        -> Result<StartSpec, PlanError>;
}

/// Strategy for `variant`.
pub fn launcher_for(variant: Variant) -> &'static dyn VariantLauncher {
    match variant {
        Variant::Script => &ScriptLauncher,
        Variant::Image => &ImageLauncher,
        Variant::Compose => &ComposeLauncher,
        Variant::Archive => &ArchiveLauncher,
    }
}

/// Guess the variant of an uploaded bundle.
///
/// A `.tar` file is an archive. In a directory, a compose file anywhere
/// wins over a Dockerfile; anything else is treated as a script bundle.
pub fn detect_variant(path: &Path) -> Variant {
    if path.is_file() {
        return if path.extension().is_some_and(|e| e == "tar") {
            Variant::Archive
        } else {
            Variant::Script
        };
    }
    if find_compose_file(path).is_some() {
        return Variant::Compose;
    }
    if find_file(path, &["Dockerfile"]).is_some() {
        return Variant::Image;
    }
    Variant::Script
}

/// First compose file under `root`, shallowest first.
pub fn find_compose_file(root: &Path) -> Option<PathBuf> {
    find_file(root, COMPOSE_FILES)
}

/// Breadth-first search for any of `names`, shallowest match first, hidden
/// directories and virtualenvs skipped. Deterministic for a given tree.
pub(crate) fn find_file(root: &Path, names: &[&str]) -> Option<PathBuf> {
    let mut queue = VecDeque::from([(root.to_path_buf(), 0usize)]);

    while let Some((dir, depth)) = queue.pop_front() {
        for name in names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        if depth >= SEARCH_DEPTH {
            continue;
        }

        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut children: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.') && n != "node_modules" && n != "__pycache__")
            })
            .collect();
        children.sort();
        queue.extend(children.into_iter().map(|p| (p, depth + 1)));
    }

    None
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use chrono::Utc;
    use hostdeck_id::AppId;

    use crate::app::{AccessPolicy, App, AppStatus, Variant};

    pub fn app(variant: Variant, source: &Path) -> App {
        App {
            id: AppId::new(),
            variant,
            status: AppStatus::Deploying,
            source: source.to_path_buf(),
            port: None,
            last_port: None,
            gpus: vec![],
            vram_required_mb: 0,
            access: AccessPolicy::default(),
            container_port: None,
            entrypoint: None,
            artifact: None,
            handle: None,
            error: None,
            generation: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

//! Runtime backend interface.
//!
//! The backend is a black box that can run build steps, start a workload
//! from a [`StartSpec`], stop it, and report whether it is still alive.
//! Two implementations exist:
//! - [`HostRuntime`]: real processes and containers on this host
//! - [`MockRuntime`]: in-memory fake for tests and development

mod command;
mod host;
mod mock;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hostdeck_id::AppId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command::{append_log, run_command, tail, CommandOutput};
pub use host::HostRuntime;
pub use mock::MockRuntime;

/// Reference to a live workload. Owned by the agent, never exposed through
/// the API.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeHandle {
    /// Process group leader started by the agent.
    Process { pid: u32 },
    /// Single container.
    Container { name: String },
    /// Compose project.
    Compose { project: String, dir: PathBuf },
}

impl std::fmt::Display for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process { pid } => write!(f, "pid:{pid}"),
            Self::Container { name } => write!(f, "container:{name}"),
            Self::Compose { project, .. } => write!(f, "compose:{project}"),
        }
    }
}

/// Build output retained so restart can skip the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    /// Script with a provisioned interpreter environment.
    Environment {
        venv: PathBuf,
        entry: PathBuf,
        workdir: PathBuf,
    },
    /// Script run with the system interpreter.
    Script { entry: PathBuf, workdir: PathBuf },
    /// Built or loaded container image.
    Image { reference: String },
    /// Compose project with built service images.
    Compose { project: String, dir: PathBuf },
}

/// An external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartSpec {
    /// Long-running process in its own process group, output to the app log.
    Process(CommandSpec),
    /// Detached container with a published port.
    Container {
        name: String,
        image: String,
        host_port: u16,
        container_port: u16,
        gpus: Vec<u32>,
        env: Vec<(String, String)>,
    },
    /// Compose project brought up detached.
    Compose {
        project: String,
        dir: PathBuf,
        env: Vec<(String, String)>,
    },
}

/// Observed liveness of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// Exited; the code is unknown for workloads the agent did not spawn.
    Exited { code: Option<i32> },
    /// The handle no longer refers to anything.
    Missing,
}

/// A live workload found on the host, labelled with its app.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObservedRuntime {
    pub app_id: Option<AppId>,
    pub handle: RuntimeHandle,
}

/// Runtime backend errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A command ran and exited unsuccessfully.
    #[error("{command} failed ({status}): {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    /// A command could not be run at all.
    #[error("failed to run {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Runtime backend.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Run one build step for `app`, appending its output to `log`.
    /// Returns the combined output.
    async fn run_build(&self, app: AppId, step: &CommandSpec, log: &Path)
        -> Result<String, RuntimeError>;

    /// Start a workload for `app`.
    async fn start(&self, app: AppId, spec: &StartSpec, log: &Path)
        -> Result<RuntimeHandle, RuntimeError>;

    /// Graceful termination, then forced termination after `grace`.
    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> Result<(), RuntimeError>;

    /// Whether the workload behind `handle` is alive.
    async fn liveness(&self, handle: &RuntimeHandle) -> Result<Liveness, RuntimeError>;

    /// Append whatever output the backend kept for `handle` to `log`.
    async fn capture_output(&self, handle: &RuntimeHandle, log: &Path) -> Result<(), RuntimeError>;

    /// Every live workload on the host that looks like one of ours.
    async fn list_live(&self) -> Result<Vec<ObservedRuntime>, RuntimeError>;

    /// Whether a retained artifact can still be started.
    async fn artifact_present(&self, artifact: &Artifact) -> Result<bool, RuntimeError>;

    /// Remove a retained artifact.
    async fn remove_artifact(&self, artifact: &Artifact) -> Result<(), RuntimeError>;
}

/// Container name for an app.
pub fn container_name(app: AppId) -> String {
    format!("hostdeck-{}", app.slug())
}

/// Compose project name for an app.
pub fn compose_project(app: AppId) -> String {
    format!("hostdeck-{}", app.slug())
}

/// Recover the app from a container or compose project name.
pub fn app_from_runtime_name(name: &str) -> Option<AppId> {
    name.strip_prefix("hostdeck-")
        .and_then(|rest| AppId::parse(rest).ok())
}

/// Label attached to every container the agent starts.
pub const APP_LABEL: &str = "hostdeck.app-id";

/// Environment variable identifying the app of a spawned process.
pub const APP_ENV: &str = "HOSTDECK_APP_ID";

//! Runtime backend for this host: interpreter processes and containers.
//!
//! Processes are started in their own process group with
//! `HOSTDECK_APP_ID` in their environment so they can be found again after
//! an agent restart. Containers carry the `hostdeck.app-id` label; compose
//! projects are recognised by their `hostdeck-` project prefix.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hostdeck_id::AppId;
use tracing::{debug, info, warn};

use super::{
    app_from_runtime_name, append_log, run_command, Artifact, CommandSpec, Liveness,
    ObservedRuntime, Runtime, RuntimeError, RuntimeHandle, StartSpec, APP_ENV, APP_LABEL,
};

/// Upper bound for build steps (image builds, dependency installs).
const BUILD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Upper bound for short container CLI calls.
const CLI_TIMEOUT: Duration = Duration::from_secs(120);

/// Poll interval while waiting for a signalled process group to exit.
const EXIT_POLL: Duration = Duration::from_millis(200);

/// Lines of container output appended to the app log on exit.
const CAPTURE_LINES: &str = "500";

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const COMPOSE_DIR_LABEL: &str = "com.docker.compose.project.working_dir";

/// Host runtime.
pub struct HostRuntime {
    docker: String,

    /// Processes spawned by this agent instance, kept so they can be reaped
    /// and their exit codes read.
    children: Mutex<HashMap<u32, tokio::process::Child>>,
}

impl HostRuntime {
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn docker(&self) -> CommandSpec {
        CommandSpec::new(&self.docker)
    }

    fn compose(&self, project: &str, dir: &Path) -> CommandSpec {
        self.docker()
            .args(["compose", "-p", project])
            .cwd(dir)
    }

    async fn cli(&self, spec: CommandSpec) -> Result<String, RuntimeError> {
        let output = run_command(&spec, CLI_TIMEOUT).await?.check(&spec)?;
        Ok(output.stdout)
    }

    // -------------------------------------------------------------------------
    // Processes
    // -------------------------------------------------------------------------

    fn spawn_process(
        &self,
        app: AppId,
        spec: &CommandSpec,
        log: &Path,
    ) -> Result<RuntimeHandle, RuntimeError> {
        if let Some(parent) = log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)?;
        let stderr = stdout.try_clone()?;

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .env(APP_ENV, app.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| RuntimeError::Spawn {
            command: spec.display(),
            reason: e.to_string(),
        })?;
        let pid = child
            .id()
            .ok_or_else(|| RuntimeError::Other("spawned process has no pid".to_string()))?;

        if let Ok(mut children) = self.children.lock() {
            children.insert(pid, child);
        }

        info!(app_id = %app, pid, command = %spec.display(), "Process started");
        Ok(RuntimeHandle::Process { pid })
    }

    fn process_liveness(&self, pid: u32) -> Liveness {
        if let Ok(mut children) = self.children.lock() {
            if let Some(child) = children.get_mut(&pid) {
                return match child.try_wait() {
                    Ok(None) => Liveness::Running,
                    Ok(Some(status)) => {
                        children.remove(&pid);
                        Liveness::Exited {
                            code: status.code(),
                        }
                    }
                    Err(e) => {
                        warn!(pid, error = %e, "Failed to poll child process");
                        Liveness::Running
                    }
                };
            }
        }

        // Adopted after a restart: not our child, exit code unknowable.
        if pid_alive(pid) {
            Liveness::Running
        } else {
            Liveness::Missing
        }
    }

    async fn stop_process(&self, pid: u32, grace: Duration) -> Result<(), RuntimeError> {
        signal_group(pid, libc::SIGTERM);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.process_liveness(pid) != Liveness::Running {
                debug!(pid, "Process exited after SIGTERM");
                return Ok(());
            }
            tokio::time::sleep(EXIT_POLL).await;
        }

        warn!(pid, grace_secs = grace.as_secs(), "Process ignored SIGTERM, sending SIGKILL");
        signal_group(pid, libc::SIGKILL);

        for _ in 0..25 {
            if self.process_liveness(pid) != Liveness::Running {
                return Ok(());
            }
            tokio::time::sleep(EXIT_POLL).await;
        }

        Err(RuntimeError::Other(format!("process {pid} survived SIGKILL")))
    }

    // -------------------------------------------------------------------------
    // Containers
    // -------------------------------------------------------------------------

    async fn container_liveness(&self, name: &str) -> Result<Liveness, RuntimeError> {
        let spec = self
            .docker()
            .args(["inspect", "-f", "{{.State.Running}} {{.State.ExitCode}}", name]);
        let output = run_command(&spec, CLI_TIMEOUT).await?;
        if !output.success() {
            return Ok(Liveness::Missing);
        }
        Ok(parse_inspect_state(&output.stdout))
    }

    async fn compose_liveness(&self, project: &str) -> Result<Liveness, RuntimeError> {
        let states = self
            .cli(self.docker().args([
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("label={COMPOSE_PROJECT_LABEL}={project}"),
                "--format".to_string(),
                "{{.State}}".to_string(),
            ]))
            .await?;
        Ok(parse_compose_states(&states))
    }

    async fn list_containers(&self) -> Result<Vec<ObservedRuntime>, RuntimeError> {
        let out = self
            .cli(self.docker().args([
                "ps".to_string(),
                "--filter".to_string(),
                format!("label={APP_LABEL}"),
                "--format".to_string(),
                format!("{{{{.Names}}}}\t{{{{.Label \"{APP_LABEL}\"}}}}"),
            ]))
            .await?;

        Ok(out
            .lines()
            .filter_map(|line| {
                let (name, label) = line.split_once('\t')?;
                Some(ObservedRuntime {
                    app_id: AppId::parse(label.trim()).ok(),
                    handle: RuntimeHandle::Container {
                        name: name.trim().to_string(),
                    },
                })
            })
            .collect())
    }

    async fn list_compose_projects(&self) -> Result<Vec<ObservedRuntime>, RuntimeError> {
        let out = self
            .cli(self.docker().args([
                "ps".to_string(),
                "--filter".to_string(),
                format!("label={COMPOSE_PROJECT_LABEL}"),
                "--format".to_string(),
                format!(
                    "{{{{.Label \"{COMPOSE_PROJECT_LABEL}\"}}}}\t{{{{.Label \"{COMPOSE_DIR_LABEL}\"}}}}"
                ),
            ]))
            .await?;

        let mut projects: BTreeMap<String, PathBuf> = BTreeMap::new();
        for line in out.lines() {
            let Some((project, dir)) = line.split_once('\t') else {
                continue;
            };
            if project.starts_with("hostdeck-") {
                projects
                    .entry(project.to_string())
                    .or_insert_with(|| PathBuf::from(dir.trim()));
            }
        }

        Ok(projects
            .into_iter()
            .map(|(project, dir)| ObservedRuntime {
                app_id: app_from_runtime_name(&project),
                handle: RuntimeHandle::Compose { project, dir },
            })
            .collect())
    }
}

#[async_trait]
impl Runtime for HostRuntime {
    async fn run_build(
        &self,
        app: AppId,
        step: &CommandSpec,
        log: &Path,
    ) -> Result<String, RuntimeError> {
        info!(app_id = %app, command = %step.display(), "Running build step");
        append_log(log, &format!("$ {}", step.display())).await?;

        let output = run_command(step, BUILD_TIMEOUT).await;
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                append_log(log, &e.to_string()).await?;
                return Err(e);
            }
        };

        let combined = output.combined();
        if !combined.is_empty() {
            append_log(log, &combined).await?;
        }
        output.check(step)?;
        Ok(combined)
    }

    async fn start(
        &self,
        app: AppId,
        spec: &StartSpec,
        log: &Path,
    ) -> Result<RuntimeHandle, RuntimeError> {
        match spec {
            StartSpec::Process(command) => self.spawn_process(app, command, log),

            StartSpec::Container {
                name,
                image,
                host_port,
                container_port,
                gpus,
                env,
            } => {
                // A container left over from a previous run would block the name.
                let _ = run_command(&self.docker().args(["rm", "-f", name.as_str()]), CLI_TIMEOUT).await;

                let mut run = self.docker().args([
                    "run".to_string(),
                    "-d".to_string(),
                    "--name".to_string(),
                    name.clone(),
                    "--label".to_string(),
                    format!("{APP_LABEL}={app}"),
                    "-p".to_string(),
                    format!("{host_port}:{container_port}"),
                ]);
                if !gpus.is_empty() {
                    run = run.arg("--gpus").arg(gpu_device_flag(gpus));
                }
                for (key, value) in env {
                    run = run.arg("-e").arg(format!("{key}={value}"));
                }
                run = run.arg(image);

                let output = run_command(&run, CLI_TIMEOUT).await?;
                append_log(log, &format!("$ {}\n{}", run.display(), output.combined())).await?;
                output.check(&run)?;

                info!(app_id = %app, container = %name, host_port, "Container started");
                Ok(RuntimeHandle::Container { name: name.clone() })
            }

            StartSpec::Compose { project, dir, env } => {
                let mut up = self.compose(project, dir).args(["up", "-d"]);
                for (key, value) in env {
                    up = up.env(key, value);
                }

                let output = run_command(&up, BUILD_TIMEOUT).await?;
                append_log(log, &format!("$ {}\n{}", up.display(), output.combined())).await?;
                output.check(&up)?;

                info!(app_id = %app, project = %project, "Compose project started");
                Ok(RuntimeHandle::Compose {
                    project: project.clone(),
                    dir: dir.clone(),
                })
            }
        }
    }

    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> Result<(), RuntimeError> {
        let grace_secs = grace.as_secs().to_string();
        match handle {
            RuntimeHandle::Process { pid } => self.stop_process(*pid, grace).await,
            RuntimeHandle::Container { name } => {
                let stop = self.docker().args(["stop", "-t", grace_secs.as_str(), name.as_str()]);
                if let Err(e) = run_command(&stop, grace + CLI_TIMEOUT).await?.check(&stop) {
                    warn!(container = %name, error = %e, "docker stop failed, removing forcefully");
                }
                // The image stays; only the container goes.
                self.cli(self.docker().args(["rm", "-f", name.as_str()])).await?;
                Ok(())
            }
            RuntimeHandle::Compose { project, dir } => {
                let stop = self.compose(project, dir).args(["stop", "-t", grace_secs.as_str()]);
                if let Err(e) = run_command(&stop, grace + CLI_TIMEOUT).await?.check(&stop) {
                    warn!(project = %project, error = %e, "docker compose stop failed");
                }
                self.cli(self.compose(project, dir).arg("down")).await?;
                Ok(())
            }
        }
    }

    async fn liveness(&self, handle: &RuntimeHandle) -> Result<Liveness, RuntimeError> {
        match handle {
            RuntimeHandle::Process { pid } => Ok(self.process_liveness(*pid)),
            RuntimeHandle::Container { name } => self.container_liveness(name).await,
            RuntimeHandle::Compose { project, .. } => self.compose_liveness(project).await,
        }
    }

    async fn capture_output(&self, handle: &RuntimeHandle, log: &Path) -> Result<(), RuntimeError> {
        let spec = match handle {
            // Process output is streamed straight into the log.
            RuntimeHandle::Process { .. } => return Ok(()),
            RuntimeHandle::Container { name } => {
                self.docker().args(["logs", "--tail", CAPTURE_LINES, name.as_str()])
            }
            RuntimeHandle::Compose { project, dir } => self
                .compose(project, dir)
                .args(["logs", "--no-color", "--tail", CAPTURE_LINES]),
        };

        let output = run_command(&spec, CLI_TIMEOUT).await?;
        append_log(log, &format!("--- output of {handle} ---\n{}", output.combined())).await
    }

    async fn list_live(&self) -> Result<Vec<ObservedRuntime>, RuntimeError> {
        let mut live = tokio::task::spawn_blocking(scan_processes)
            .await
            .map_err(|e| RuntimeError::Other(format!("process scan panicked: {e}")))??;

        // A partial listing would read as dead workloads, so any failure fails the whole call.
        live.extend(self.list_containers().await?);
        live.extend(self.list_compose_projects().await?);

        live.sort();
        Ok(live)
    }

    async fn artifact_present(&self, artifact: &Artifact) -> Result<bool, RuntimeError> {
        Ok(match artifact {
            Artifact::Environment { venv, entry, .. } => {
                venv.join("bin/python").exists() && entry.exists()
            }
            Artifact::Script { entry, .. } => entry.exists(),
            Artifact::Image { reference } => {
                let spec = self.docker().args(["image", "inspect", reference.as_str()]);
                run_command(&spec, CLI_TIMEOUT).await?.success()
            }
            Artifact::Compose { dir, .. } => crate::launch::find_compose_file(dir).is_some(),
        })
    }

    async fn remove_artifact(&self, artifact: &Artifact) -> Result<(), RuntimeError> {
        match artifact {
            Artifact::Environment { venv, .. } => match tokio::fs::remove_dir_all(venv).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            Artifact::Script { .. } => Ok(()),
            Artifact::Image { reference } => {
                self.cli(self.docker().args(["rmi", "-f", reference.as_str()])).await?;
                Ok(())
            }
            Artifact::Compose { project, dir } => {
                self.cli(
                    self.compose(project, dir)
                        .args(["down", "--rmi", "local", "--remove-orphans"]),
                )
                .await?;
                Ok(())
            }
        }
    }
}

/// `--gpus` value for specific devices. Docker parses the value as CSV, so
/// multiple devices need the inner quotes.
pub fn gpu_device_flag(gpus: &[u32]) -> String {
    let list = gpus
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!("\"device={list}\"")
}

fn parse_inspect_state(text: &str) -> Liveness {
    let mut parts = text.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("true"), _) => Liveness::Running,
        (Some("false"), code) => Liveness::Exited {
            code: code.and_then(|c| c.parse().ok()),
        },
        _ => Liveness::Missing,
    }
}

fn parse_compose_states(text: &str) -> Liveness {
    let states: Vec<&str> = text.lines().map(str::trim).filter(|s| !s.is_empty()).collect();
    if states.is_empty() {
        Liveness::Missing
    } else if states.iter().any(|s| *s == "running" || *s == "restarting") {
        Liveness::Running
    } else {
        Liveness::Exited { code: None }
    }
}

fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: plain signal delivery; the group id equals the leader pid
    // because processes are spawned with process_group(0).
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        // Fall back to the leader alone (e.g. adopted process that left its group).
        // SAFETY: as above.
        unsafe { libc::kill(pid, signal) };
    }
}

/// Find process group leaders carrying `HOSTDECK_APP_ID`.
fn scan_processes() -> Result<Vec<ObservedRuntime>, RuntimeError> {
    let mut found = Vec::new();
    let marker = format!("{APP_ENV}=");

    for entry in std::fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };

        let Ok(environ) = std::fs::read(entry.path().join("environ")) else {
            continue;
        };
        let Some(app_id) = environ
            .split(|b| *b == 0)
            .filter_map(|var| std::str::from_utf8(var).ok())
            .find_map(|var| var.strip_prefix(marker.as_str()))
            .map(str::to_string)
        else {
            continue;
        };

        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if process_group(&stat) != Some(pid) {
            continue;
        }

        found.push(ObservedRuntime {
            app_id: AppId::parse(&app_id).ok(),
            handle: RuntimeHandle::Process { pid },
        });
    }

    Ok(found)
}

/// Process group id from `/proc/<pid>/stat` (fields after the command name:
/// state, ppid, pgrp). Zombies are skipped.
fn process_group(stat: &str) -> Option<u32> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?;
    if state == "Z" || state == "X" {
        return None;
    }
    let _ppid = fields.next()?;
    fields.next()?.parse().ok()
}

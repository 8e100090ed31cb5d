//! External command execution with bounded runtime.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{CommandSpec, RuntimeError};

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }

    /// Convert a non-zero exit into [`RuntimeError::CommandFailed`].
    pub fn check(self, spec: &CommandSpec) -> Result<Self, RuntimeError> {
        if self.success() {
            return Ok(self);
        }
        Err(RuntimeError::CommandFailed {
            command: spec.display(),
            status: self
                .code
                .map(|c| format!("exit {c}"))
                .unwrap_or_else(|| "killed".to_string()),
            output: tail(&self.combined(), 40),
        })
    }
}

/// Run `spec` to completion, killing it if it outlives `timeout`.
///
/// Stdout and stderr are drained concurrently with `wait` so a chatty child
/// cannot block on a full pipe.
pub async fn run_command(spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput, RuntimeError> {
    let mut command = tokio::process::Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| RuntimeError::Spawn {
        command: spec.display(),
        reason: e.to_string(),
    })?;

    let mut stdout_handle = child.stdout.take();
    let mut stderr_handle = child.stderr.take();

    tokio::select! {
        result = async {
            let (status, stdout, stderr) = tokio::join!(
                child.wait(),
                async {
                    let mut buf = Vec::new();
                    if let Some(ref mut h) = stdout_handle {
                        let _ = h.read_to_end(&mut buf).await;
                    }
                    buf
                },
                async {
                    let mut buf = Vec::new();
                    if let Some(ref mut h) = stderr_handle {
                        let _ = h.read_to_end(&mut buf).await;
                    }
                    buf
                },
            );
            let status = status?;
            Ok::<_, RuntimeError>(CommandOutput {
                code: status.code(),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        } => result,
        () = tokio::time::sleep(timeout) => {
            let _ = child.kill().await;
            Err(RuntimeError::CommandFailed {
                command: spec.display(),
                status: format!("timed out after {}s", timeout.as_secs()),
                output: String::new(),
            })
        }
    }
}

/// Append `text` to the log at `path`, creating it if needed.
pub async fn append_log(path: &Path, text: &str) -> Result<(), RuntimeError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    if !text.ends_with('\n') {
        file.write_all(b"\n").await?;
    }
    Ok(())
}

/// Last `lines` lines of `text`.
pub fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = run_command(&spec, Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");

        let err = output.check(&spec).unwrap_err();
        assert!(matches!(err, RuntimeError::CommandFailed { ref status, .. } if status == "exit 3"));
    }

    #[tokio::test]
    async fn test_run_command_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo $GREETING; pwd"])
            .env("GREETING", "hello")
            .cwd(dir.path());
        let output = run_command(&spec, Duration::from_secs(5)).await.unwrap();
        assert!(output.success());
        assert!(output.stdout.starts_with("hello\n"));
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let spec = CommandSpec::new("sleep").arg("5");
        let err = run_command(&spec, Duration::from_millis(100)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-hostdeck");
        let err = run_command(&spec, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_append_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/app.log");
        append_log(&path, "one").await.unwrap();
        append_log(&path, "two\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
    }
}

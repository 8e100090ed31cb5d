//! Single-script apps run by the interpreter.

use std::path::{Path, PathBuf};

use super::{LaunchContext, PlanError, VariantLauncher};
use crate::app::Variant;
use crate::runtime::{Artifact, CommandSpec, StartSpec};

/// Dependency manifest that triggers environment provisioning.
const REQUIREMENTS: &str = "requirements.txt";

/// Environment directory created inside the bundle.
const VENV_DIR: &str = ".venv";

pub struct ScriptLauncher;

/// Directory the script runs in: the bundle, or the parent of a lone script.
fn workdir_of(source: &Path) -> PathBuf {
    if source.is_file() {
        source.parent().map(Path::to_path_buf).unwrap_or_default()
    } else {
        source.to_path_buf()
    }
}

/// Pick the script to run: the explicit override, else `app.py`, else
/// `main.py`, else the first `*.py` by name.
pub fn resolve_entry_script(dir: &Path, entrypoint: Option<&str>) -> Result<PathBuf, PlanError> {
    if dir.is_file() {
        return Ok(dir.to_path_buf());
    }
    if let Some(name) = entrypoint {
        let path = dir.join(name);
        if !path.is_file() || !path.starts_with(dir) {
            return Err(PlanError::MissingEntryScript(path));
        }
        return Ok(path);
    }

    for name in ["app.py", "main.py"] {
        let path = dir.join(name);
        if path.is_file() {
            return Ok(path);
        }
    }

    let mut scripts: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|_| PlanError::NoEntryScript(dir.to_path_buf()))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "py"))
        .collect();
    scripts.sort();

    scripts
        .into_iter()
        .next()
        .ok_or_else(|| PlanError::NoEntryScript(dir.to_path_buf()))
}

impl VariantLauncher for ScriptLauncher {
    fn build_steps(&self, ctx: &LaunchContext<'_>) -> Result<Vec<CommandSpec>, PlanError> {
        resolve_entry_script(&ctx.app.source, ctx.app.entrypoint.as_deref())?;
        let dir = &workdir_of(&ctx.app.source);

        if !dir.join(REQUIREMENTS).is_file() {
            return Ok(Vec::new());
        }

        let venv = dir.join(VENV_DIR);
        let mut install = CommandSpec::new(venv.join("bin/pip").to_string_lossy())
            .args(["install", "--disable-pip-version-check", "-r", REQUIREMENTS])
            .cwd(dir);
        if let Some((key, value)) = ctx.credential_env() {
            install = install.env(key, value);
        }

        Ok(vec![
            CommandSpec::new(&ctx.settings.python)
                .args(["-m", "venv", VENV_DIR])
                .cwd(dir),
            install,
        ])
    }

    fn artifact(&self, ctx: &LaunchContext<'_>, outputs: &[String]) -> Result<Artifact, PlanError> {
        let entry = resolve_entry_script(&ctx.app.source, ctx.app.entrypoint.as_deref())?;
        let dir = workdir_of(&ctx.app.source);

        Ok(if outputs.is_empty() {
            Artifact::Script {
                entry,
                workdir: dir,
            }
        } else {
            Artifact::Environment {
                venv: dir.join(VENV_DIR),
                entry,
                workdir: dir,
            }
        })
    }

    fn start_spec(
        &self,
        ctx: &LaunchContext<'_>,
        artifact: &Artifact,
    ) -> Result<StartSpec, PlanError> {
        let (interpreter, entry, workdir) = match artifact {
            Artifact::Environment {
                venv,
                entry,
                workdir,
            } => (venv.join("bin/python").to_string_lossy().into_owned(), entry, workdir),
            Artifact::Script { entry, workdir } => (ctx.settings.python.clone(), entry, workdir),
            _ => return Err(PlanError::ArtifactMismatch(Variant::Script)),
        };

        let mut command = CommandSpec::new(interpreter)
            .arg(entry.to_string_lossy())
            .cwd(workdir)
            .env("PORT", ctx.port.to_string())
            .env("PYTHONUNBUFFERED", "1");
        if let Some(devices) = ctx.visible_devices() {
            command = command.env("CUDA_VISIBLE_DEVICES", devices);
        }
        if let Some((key, value)) = ctx.credential_env() {
            command = command.env(key, value);
        }

        Ok(StartSpec::Process(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::test_support::app;
    use crate::launch::LaunchSettings;
    use std::fs;

    fn env_of(spec: &StartSpec) -> Vec<(String, String)> {
        match spec {
            StartSpec::Process(cmd) => cmd.env.clone(),
            other => panic!("expected a process, got {other:?}"),
        }
    }

    #[test]
    fn test_entry_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("zeta.py"), "").unwrap();
        fs::write(dir.path().join("alpha.py"), "").unwrap();
        assert_eq!(
            resolve_entry_script(dir.path(), None).unwrap(),
            dir.path().join("alpha.py")
        );

        fs::write(dir.path().join("main.py"), "").unwrap();
        assert_eq!(
            resolve_entry_script(dir.path(), None).unwrap(),
            dir.path().join("main.py")
        );

        fs::write(dir.path().join("app.py"), "").unwrap();
        assert_eq!(
            resolve_entry_script(dir.path(), None).unwrap(),
            dir.path().join("app.py")
        );

        assert_eq!(
            resolve_entry_script(dir.path(), Some("zeta.py")).unwrap(),
            dir.path().join("zeta.py")
        );
        assert!(resolve_entry_script(dir.path(), Some("missing.py")).is_err());
    }

    #[test]
    fn test_lone_script_runs_from_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("serve.py");
        fs::write(&script, "").unwrap();
        let app = app(Variant::Script, &script);
        let settings = LaunchSettings::default();
        let ctx = LaunchContext { app: &app, port: 9001, gpus: &[], settings: &settings };

        let artifact = ScriptLauncher.artifact(&ctx, &[]).unwrap();
        assert_eq!(
            artifact,
            Artifact::Script { entry: script.clone(), workdir: dir.path().to_path_buf() }
        );
    }

    #[test]
    fn test_no_script_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README.md"), "").unwrap();
        assert!(matches!(
            resolve_entry_script(dir.path(), None),
            Err(PlanError::NoEntryScript(_))
        ));
    }

    #[test]
    fn test_without_manifest_skips_build() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.py"), "").unwrap();
        let app = app(Variant::Script, dir.path());
        let settings = LaunchSettings::default();
        let ctx = LaunchContext { app: &app, port: 9001, gpus: &[], settings: &settings };

        assert!(ScriptLauncher.build_steps(&ctx).unwrap().is_empty());
        let artifact = ScriptLauncher.artifact(&ctx, &[]).unwrap();
        assert!(matches!(artifact, Artifact::Script { .. }));

        let spec = ScriptLauncher.start_spec(&ctx, &artifact).unwrap();
        let env = env_of(&spec);
        assert!(env.contains(&("PORT".to_string(), "9001".to_string())));
        assert!(!env.iter().any(|(k, _)| k == "CUDA_VISIBLE_DEVICES"));
    }

    #[test]
    fn test_manifest_provisions_environment() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.py"), "").unwrap();
        fs::write(dir.path().join("requirements.txt"), "gradio\n").unwrap();
        let app = app(Variant::Script, dir.path());
        let settings = LaunchSettings {
            hf_token: Some("hf_abc".to_string()),
            ..LaunchSettings::default()
        };
        let ctx = LaunchContext { app: &app, port: 9002, gpus: &[0, 1], settings: &settings };

        let steps = ScriptLauncher.build_steps(&ctx).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].args, vec!["-m", "venv", ".venv"]);
        assert!(steps[1].program.ends_with(".venv/bin/pip"));

        let outputs = vec![String::new(), String::new()];
        let artifact = ScriptLauncher.artifact(&ctx, &outputs).unwrap();
        let spec = ScriptLauncher.start_spec(&ctx, &artifact).unwrap();
        let StartSpec::Process(cmd) = &spec else {
            panic!("expected a process");
        };
        assert!(cmd.program.ends_with(".venv/bin/python"));
        assert!(cmd.env.contains(&("CUDA_VISIBLE_DEVICES".to_string(), "0,1".to_string())));
        assert!(cmd.env.contains(&("HF_TOKEN".to_string(), "hf_abc".to_string())));
    }

    #[test]
    fn test_rejects_foreign_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(Variant::Script, dir.path());
        let settings = LaunchSettings::default();
        let ctx = LaunchContext { app: &app, port: 9001, gpus: &[], settings: &settings };
        let artifact = Artifact::Image { reference: "x".to_string() };
        assert!(ScriptLauncher.start_spec(&ctx, &artifact).is_err());
    }
}

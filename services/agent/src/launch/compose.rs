//! Multi-service apps described by a compose file.

use super::{find_compose_file, LaunchContext, PlanError, VariantLauncher};
use crate::app::Variant;
use crate::runtime::{compose_project, Artifact, CommandSpec, StartSpec};

pub struct ComposeLauncher;

/// Environment handed to compose so the file can interpolate the host port
/// and GPU selection.
fn compose_env(ctx: &LaunchContext<'_>) -> Vec<(String, String)> {
    let mut env = vec![(ctx.settings.compose_port_var.clone(), ctx.port.to_string())];
    if let Some(devices) = ctx.visible_devices() {
        env.push(("CUDA_VISIBLE_DEVICES".to_string(), devices.clone()));
        env.push(("NVIDIA_VISIBLE_DEVICES".to_string(), devices));
    }
    env.extend(ctx.credential_env());
    env
}

impl VariantLauncher for ComposeLauncher {
    fn build_steps(&self, ctx: &LaunchContext<'_>) -> Result<Vec<CommandSpec>, PlanError> {
        let source = &ctx.app.source;
        let file = find_compose_file(source).ok_or_else(|| PlanError::NoComposeFile(source.clone()))?;
        let dir = file.parent().unwrap_or(source);

        let mut build = CommandSpec::new(&ctx.settings.docker)
            .args(["compose", "-p"])
            .arg(compose_project(ctx.app.id))
            .arg("build")
            .cwd(dir);
        for (key, value) in compose_env(ctx) {
            build = build.env(key, value);
        }
        Ok(vec![build])
    }

    fn artifact(&self, ctx: &LaunchContext<'_>, _outputs: &[String]) -> Result<Artifact, PlanError> {
        let source = &ctx.app.source;
        let file = find_compose_file(source).ok_or_else(|| PlanError::NoComposeFile(source.clone()))?;
        let dir = file.parent().unwrap_or(source).to_path_buf();

        Ok(Artifact::Compose {
            project: compose_project(ctx.app.id),
            dir,
        })
    }

    fn start_spec(
        &self,
        ctx: &LaunchContext<'_>,
        artifact: &Artifact,
    ) -> Result<StartSpec, PlanError> {
        let Artifact::Compose { project, dir } = artifact else {
            return Err(PlanError::ArtifactMismatch(Variant::Compose));
        };
        Ok(StartSpec::Compose {
            project: project.clone(),
            dir: dir.clone(),
            env: compose_env(ctx),
        })
    }
}

//! Apps shipped as a saved image archive.

use super::image::{container_port, container_spec};
use super::{LaunchContext, PlanError, VariantLauncher};
use crate::app::Variant;
use crate::runtime::{Artifact, CommandSpec, StartSpec};

pub struct ArchiveLauncher;

/// Image named by `docker load` output. The last loaded image wins.
pub fn parse_loaded_image(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix("Loaded image: ")
                .or_else(|| line.strip_prefix("Loaded image ID: "))
        })
        .map(str::trim)
        .filter(|image| !image.is_empty())
        .last()
        .map(str::to_string)
}

impl VariantLauncher for ArchiveLauncher {
    fn build_steps(&self, ctx: &LaunchContext<'_>) -> Result<Vec<CommandSpec>, PlanError> {
        Ok(vec![CommandSpec::new(&ctx.settings.docker)
            .args(["load", "-i"])
            .arg(ctx.app.source.to_string_lossy())])
    }

    fn artifact(&self, _ctx: &LaunchContext<'_>, outputs: &[String]) -> Result<Artifact, PlanError> {
        let reference = outputs
            .iter()
            .rev()
            .find_map(|out| parse_loaded_image(out))
            .ok_or(PlanError::UnknownLoadedImage)?;
        Ok(Artifact::Image { reference })
    }

    fn start_spec(
        &self,
        ctx: &LaunchContext<'_>,
        artifact: &Artifact,
    ) -> Result<StartSpec, PlanError> {
        let Artifact::Image { reference } = artifact else {
            return Err(PlanError::ArtifactMismatch(Variant::Archive));
        };
        Ok(container_spec(ctx, reference, container_port(ctx, None)))
    }
}

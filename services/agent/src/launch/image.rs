//! Apps built from a Dockerfile into a local image.

use std::path::Path;

use super::{find_file, LaunchContext, PlanError, VariantLauncher};
use crate::app::Variant;
use crate::runtime::{container_name, Artifact, CommandSpec, StartSpec};

pub struct ImageLauncher;

/// Local tag for an app's image.
fn image_tag(ctx: &LaunchContext<'_>) -> String {
    format!("hostdeck/{}:latest", ctx.app.id.slug())
}

/// First port in an `EXPOSE` instruction, if any.
pub fn parse_exposed_port(dockerfile: &str) -> Option<u16> {
    dockerfile.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        if !words.next()?.eq_ignore_ascii_case("EXPOSE") {
            return None;
        }
        words.find_map(|w| w.split('/').next()?.parse().ok())
    })
}

/// Container-side port: the request, then the Dockerfile, then the default.
pub(super) fn container_port(ctx: &LaunchContext<'_>, dockerfile: Option<&Path>) -> u16 {
    ctx.app
        .container_port
        .or_else(|| {
            dockerfile
                .and_then(|p| std::fs::read_to_string(p).ok())
                .and_then(|text| parse_exposed_port(&text))
        })
        .unwrap_or(ctx.settings.default_container_port)
}

/// Container start for a ready image, shared with archives.
pub(super) fn container_spec(ctx: &LaunchContext<'_>, image: &str, port: u16) -> StartSpec {
    let mut env = vec![("PORT".to_string(), port.to_string())];
    env.extend(ctx.credential_env());

    StartSpec::Container {
        name: container_name(ctx.app.id),
        image: image.to_string(),
        host_port: ctx.port,
        container_port: port,
        gpus: ctx.gpus.to_vec(),
        env,
    }
}

impl VariantLauncher for ImageLauncher {
    fn build_steps(&self, ctx: &LaunchContext<'_>) -> Result<Vec<CommandSpec>, PlanError> {
        let source = &ctx.app.source;
        let dockerfile = find_file(source, &["Dockerfile"])
            .ok_or_else(|| PlanError::NoBuildFile(source.clone()))?;
        let context = dockerfile.parent().unwrap_or(source);

        let mut build = CommandSpec::new(&ctx.settings.docker)
            .args(["build", "-t"])
            .arg(image_tag(ctx));
        if let Some((key, value)) = ctx.credential_env() {
            build = build
                .args(["--build-arg", key.as_str()])
                .env(key, value);
        }

        Ok(vec![build.arg(context.to_string_lossy()).cwd(context)])
    }

    fn artifact(&self, ctx: &LaunchContext<'_>, _outputs: &[String]) -> Result<Artifact, PlanError> {
        Ok(Artifact::Image {
            reference: image_tag(ctx),
        })
    }

    fn start_spec(
        &self,
        ctx: &LaunchContext<'_>,
        artifact: &Artifact,
    ) -> Result<StartSpec, PlanError> {
        let Artifact::Image { reference } = artifact else {
            return Err(PlanError::ArtifactMismatch(Variant::Image));
        };

        let dockerfile = find_file(&ctx.app.source, &["Dockerfile"]);
        let port = container_port(ctx, dockerfile.as_deref());
        Ok(container_spec(ctx, reference, port))
    }
}

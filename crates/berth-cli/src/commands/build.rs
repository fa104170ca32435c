//! `berth build`: Build an image from a Dockerfile.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use berth_image::dockerfile::{Dockerfile, ImageBuilder};

use super::Session;
use crate::output::{self, BOLD, GREEN, RESET};

/// Arguments for the `build` command.
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Dockerfile to build; its directory is the build context.
    #[arg(default_value = "Dockerfile")]
    pub dockerfile: PathBuf,

    /// Tag for the built image. Repeatable; the first names the build.
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Build argument in `KEY=VALUE` form. Repeatable.
    #[arg(long = "build-arg", value_parser = parse_build_arg)]
    pub build_args: Vec<(String, String)>,

    /// Push every tag after a successful build.
    #[arg(long)]
    pub push: bool,
}

fn parse_build_arg(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

/// Executes the `build` command.
///
/// # Errors
///
/// Returns an error if the Dockerfile is invalid, the build reports an
/// error, or the optional push fails.
pub async fn execute(session: &Session, args: BuildArgs) -> anyhow::Result<()> {
    let dockerfile = Dockerfile {
        path: args.dockerfile,
        tags: args.tags,
        args: args.build_args.into_iter().collect(),
    };
    // Fail on a bad Dockerfile before touching the runtime.
    dockerfile.validate()?;

    let api = session.connect().await?;
    let builder = ImageBuilder::new(api, session.auth.clone());

    let report = builder
        .build(&dockerfile)
        .await?
        .subscribe(|item| {
            if let Some(text) = output::render_event(item, false) {
                output::line(&text);
            }
        })
        .await
        .into_result()
        .with_context(|| format!("building {}", dockerfile.path.display()))?;

    let image = report
        .image_id
        .map_or_else(|| "<unknown>".to_string(), |id| id.to_string());
    eprintln!("{GREEN}{BOLD}Built{RESET} {image}");
    for tag in &dockerfile.tags {
        eprintln!("  tagged {tag}");
    }

    if args.push {
        super::push::push_tags(&builder, &dockerfile.tags).await?;
    }
    Ok(())
}

//! `berth push`: Push image tags to their registries.

use anyhow::Context;
use clap::Args;

use berth_image::dockerfile::ImageBuilder;

use super::Session;
use crate::output::{self, BOLD, GREEN, RESET};

/// Arguments for the `push` command.
#[derive(Args, Debug)]
pub struct PushArgs {
    /// Full tags to push, each to its own registry.
    pub tags: Vec<String>,
}

/// Executes the `push` command.
///
/// # Errors
///
/// Returns an error if no tag is given, credentials cannot be resolved,
/// or any push reports an error.
pub async fn execute(session: &Session, args: PushArgs) -> anyhow::Result<()> {
    if args.tags.is_empty() {
        return Err(berth_common::error::BerthError::NoTags.into());
    }
    let api = session.connect().await?;
    let builder = ImageBuilder::new(api, session.auth.clone());
    push_tags(&builder, &args.tags).await
}

/// Pushes `tags` and prints the digest of each.
///
/// # Errors
///
/// Returns an error if any push fails.
pub async fn push_tags(builder: &ImageBuilder, tags: &[String]) -> anyhow::Result<()> {
    let multi = tags.len() > 1;
    let report = builder
        .push(tags)
        .await?
        .subscribe(|item| {
            if let Some(text) = output::render_event(item, multi) {
                output::line(&text);
            }
        })
        .await
        .into_result()
        .context("pushing tags")?;

    for tag in tags {
        match report.tag_digests.get(tag) {
            Some(td) => eprintln!(
                "{GREEN}{BOLD}Pushed{RESET} {tag} {} ({})",
                td.digest,
                output::format_bytes(td.size)
            ),
            None => eprintln!("{GREEN}{BOLD}Pushed{RESET} {tag}"),
        }
    }
    Ok(())
}

//! `berth resolve`: Pin an image reference to its remote digest.

use std::time::Duration;

use clap::Args;

use berth_image::reference::ImageReference;
use berth_image::registry::RegistryClient;

use super::Session;
use crate::output;

/// Arguments for the `resolve` command.
#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Reference in `name[:tag]` or `name@digest` form.
    pub reference: String,

    /// Only parse and normalise the reference, without contacting the registry.
    #[arg(long)]
    pub offline: bool,
}

/// Executes the `resolve` command.
///
/// # Errors
///
/// Returns an error if the reference is invalid or the registry cannot
/// serve its manifest.
pub async fn execute(session: &Session, args: ResolveArgs) -> anyhow::Result<()> {
    let resolved = if args.offline {
        ImageReference::parse(&args.reference)?
    } else {
        let timeout = Duration::from_secs(session.config.registry_timeout_secs);
        RegistryClient::new(session.auth.clone(), timeout)?
            .resolve(&args.reference)
            .await?
    };
    output::line(&resolved.reference);
    Ok(())
}

//! `berth destroy`: Remove every container left behind by a run.

use std::time::Duration;

use clap::Args;

use berth_runtime::teardown::teardown_by_label;

use super::Session;

/// Arguments for the `destroy` command.
#[derive(Args, Debug)]
pub struct DestroyArgs {
    /// Identifier of the run whose containers are removed.
    pub run_id: String,
}

/// Executes the `destroy` command.
///
/// # Errors
///
/// Returns an error if the containers cannot be listed or removed.
pub async fn execute(session: &Session, args: DestroyArgs) -> anyhow::Result<()> {
    let api = session.connect().await?;
    let grace = Duration::from_secs(session.config.stop_grace_secs);
    let removed = teardown_by_label(api, &session.config.label_key, &args.run_id, grace).await?;
    tracing::info!(run_id = %args.run_id, removed, "run destroyed");
    eprintln!("Removed {removed} container(s) for run {}", args.run_id);
    Ok(())
}

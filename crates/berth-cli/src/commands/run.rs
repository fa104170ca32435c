//! `berth run`: Run commands in a throwaway container.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use berth_common::types::RunId;
use berth_core::api::InputSource;
use berth_runtime::context::RunContext;
use berth_runtime::run::Run;
use berth_runtime::teardown::teardown_by_label;
use berth_runtime::volume::Volume;

use super::Session;
use crate::output::{BOLD, DIM, GREEN, RESET};

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Image reference to run.
    pub image: String,

    /// Shell commands, run in order; the first failure stops the rest.
    #[arg(last = true, required = true)]
    pub commands: Vec<String>,

    /// Volume in `host:container[:ro|rw]` form. Repeatable.
    #[arg(short, long = "volume")]
    pub volumes: Vec<Volume>,

    /// Environment variable in `KEY=VALUE` form. Repeatable.
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// User the commands run as; created inside the container if missing.
    #[arg(short, long)]
    pub user: Option<String>,

    /// Working directory of the commands.
    #[arg(short, long)]
    pub workdir: Option<String>,

    /// Run the container privileged.
    #[arg(long)]
    pub privileged: bool,

    /// Mount the runtime socket into the container.
    #[arg(long)]
    pub dind: bool,

    /// Allocate a pseudo terminal for the commands.
    #[arg(short, long)]
    pub tty: bool,

    /// Forward this process's standard input to the commands.
    #[arg(short, long)]
    pub interactive: bool,

    /// Echo every command and copy before it runs.
    #[arg(long)]
    pub debug: bool,

    /// Suppress pull progress and echoes.
    #[arg(long)]
    pub silent: bool,

    /// Prefix written before every output line.
    #[arg(long, default_value = "")]
    pub prefix: String,

    /// Run identifier; generated when omitted.
    #[arg(long)]
    pub id: Option<String>,
}

/// Executes the `run` command.
///
/// An interrupt aborts the run and removes every container carrying its
/// label before returning.
///
/// # Errors
///
/// Returns an error if any step of the run fails, a command exits
/// non-zero, or the run is interrupted.
pub async fn execute(session: &Session, args: RunArgs) -> anyhow::Result<()> {
    let api = session.connect().await?;
    let mut run = Run::new(Arc::clone(&api), &args.image, &session.config)?
        .with_auth(session.auth.clone())
        .with_volumes(args.volumes)
        .with_env(args.env);
    if let Some(id) = args.id {
        run = run.with_id(RunId::new(id));
    }
    let run_id = run.id().clone();

    let stdin = args.interactive.then(|| {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(tokio::io::stdin());
        InputSource::new(tokio::sync::Mutex::new(reader))
    });
    let ctx = RunContext {
        prefix: args.prefix,
        user: args.user,
        workdir: args.workdir,
        privileged: args.privileged,
        docker_in_docker: args.dind,
        tty: args.tty,
        debug: args.debug,
        silent: args.silent,
        stdin,
        ..RunContext::default()
    };

    let (tx, mut interrupted) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("installing Ctrl+C handler")?;

    eprintln!("{DIM}run {run_id} on {}{RESET}", args.image);
    tokio::select! {
        result = run.run(&ctx, &args.commands) => {
            let report = result?;
            let elapsed = (report.finished_at - report.started_at)
                .to_std()
                .map_or(0.0, |d| d.as_secs_f64());
            eprintln!(
                "{GREEN}{BOLD}Done{RESET} {} command(s) in {elapsed:.1}s",
                report.commands.len()
            );
            for path in &report.copied_back {
                eprintln!("  copied back {}", path.display());
            }
            Ok(())
        }
        _ = interrupted.recv() => {
            eprintln!("Interrupted, removing containers of run {run_id}...");
            let grace = Duration::from_secs(session.config.stop_grace_secs);
            let removed = teardown_by_label(api, &session.config.label_key, run_id.as_str(), grace).await?;
            tracing::info!(run_id = %run_id, removed, "interrupted run cleaned up");
            anyhow::bail!("run {run_id} interrupted")
        }
    }
}

//! CLI command definitions and dispatch.

pub mod build;
pub mod destroy;
pub mod push;
pub mod resolve;
pub mod run;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use berth_common::config::BerthConfig;
use berth_common::constants::BIN_NAME;
use berth_core::api::ContainerApi;
use berth_core::docker::DockerApi;
use berth_image::auth::AuthResolver;

/// Berth: build, push, and run ephemeral containers.
#[derive(Parser, Debug)]
#[command(name = BIN_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// YAML configuration file.
    #[arg(long, global = true, env = "BERTH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Runtime endpoint, overriding configuration and `DOCKER_HOST`.
    #[arg(long, global = true)]
    pub docker_host: Option<String>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build an image from a Dockerfile.
    Build(build::BuildArgs),
    /// Push image tags to their registries.
    Push(push::PushArgs),
    /// Pin an image reference to its current remote digest.
    Resolve(resolve::ResolveArgs),
    /// Run commands in a throwaway container.
    Run(run::RunArgs),
    /// Remove every container left behind by a run.
    Destroy(destroy::DestroyArgs),
}

/// Shared state handed to every command.
pub struct Session {
    /// Effective configuration.
    pub config: BerthConfig,
    /// Registry credential resolver.
    pub auth: AuthResolver,
}

impl Session {
    fn load(cli: &Cli) -> anyhow::Result<Self> {
        let config = match &cli.config {
            Some(path) => BerthConfig::load(path)?,
            None => BerthConfig::default(),
        };
        let mut config = config.with_env_overrides()?;
        if let Some(host) = &cli.docker_host {
            config.docker_host = Some(host.clone());
        }
        let auth = AuthResolver::from_docker_config(config.docker_config_file());
        Ok(Self { config, auth })
    }

    /// Connects to the container runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime is unreachable.
    pub async fn connect(&self) -> anyhow::Result<Arc<dyn ContainerApi>> {
        let api = DockerApi::connect(&self.config)
            .await
            .context("connecting to the container runtime")?;
        Ok(Arc::new(api))
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let session = Session::load(&cli)?;
    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Command::Build(args) => build::execute(&session, args).await,
            Command::Push(args) => push::execute(&session, args).await,
            Command::Resolve(args) => resolve::execute(&session, args).await,
            Command::Run(args) => run::execute(&session, args).await,
            Command::Destroy(args) => destroy::execute(&session, args).await,
        }
    })
}

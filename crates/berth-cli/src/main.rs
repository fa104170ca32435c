//! # berth: Berth CLI
//!
//! Builds and pushes images from Dockerfiles, resolves image digests, and
//! runs command sequences in throwaway, labelled containers.

mod commands;
mod output;

use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::execute(cli)
}

//! Statebase - unified CLI entrypoint.
//!
//! Usage:
//!   statebase start --config config/statebase.toml
//!   statebase config validate --config config/statebase.toml
//!   statebase config generate --env prod
//!   statebase compact --config config/statebase.toml [--retain N] [--dry-run]

use anyhow::Result;
use clap::Parser;
use statebase::cli::commands::{run_compact, run_config, run_start};
use statebase::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine config path - use global --config or default
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/statebase.toml"));

    match cli.command {
        Commands::Start(args) => run_start(&config_path, cli.log_level, args).await,
        Commands::Config(args) => run_config(args),
        Commands::Compact(args) => run_compact(&config_path, cli.log_level, args).await,
    }
}

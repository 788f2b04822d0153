//! Command-line interface.
//!
//! Unified CLI for statebase operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// Statebase - etcd v3 API over a SQL datastore.
#[derive(Parser, Debug)]
#[command(name = "statebase")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the statebase server.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Compact revision history.
    Compact(commands::CompactArgs),
}

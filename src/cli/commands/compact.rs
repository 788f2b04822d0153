//! Compact command implementation.
//!
//! This is the external compaction caller: run it periodically (cron,
//! systemd timer, Kubernetes CronJob) against the same config as the server.

use super::start::init_tracing;
use crate::core::config::Config;
use crate::kv::{Backend, CompactionPolicy, SqlLog};
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Compact revision history.
#[derive(Args, Debug, Default)]
pub struct CompactArgs {
    /// Revisions to keep (defaults to compaction.retain_revisions).
    #[arg(long)]
    pub retain: Option<i64>,

    /// Compact up to this revision instead of deriving one from retention.
    #[arg(long)]
    pub revision: Option<i64>,

    /// Print the plan without deleting anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Run the compact command.
pub async fn run_compact(config_path: &Path, log_level: Option<String>, args: CompactArgs) -> Result<()> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    if let Some(level) = log_level {
        config.telemetry.log_level = level;
    }
    init_tracing(&config.telemetry.log_level);

    let mut policy = CompactionPolicy::from(&config.compaction);
    if let Some(retain) = args.retain {
        if retain < 0 {
            anyhow::bail!("--retain must be >= 0");
        }
        policy = CompactionPolicy::with_retention(retain);
    }

    let engine = SqlLog::open(&config.datastore)
        .await
        .context("failed to open datastore")?;
    let result = compact_with(&engine, policy, &args).await;
    engine.driver().close().await;
    result
}

async fn compact_with(engine: &SqlLog, policy: CompactionPolicy, args: &CompactArgs) -> Result<()> {
    let current = engine.current_revision().await?;
    let watermark = engine.compact_revision().await?;

    let target = match args.revision {
        Some(revision) => Some(policy.clamp(revision, current)).filter(|t| *t > watermark),
        None => policy.propose_target(current, watermark),
    };

    println!("current revision:    {}", current);
    println!("compaction watermark: {}", watermark);

    let Some(target) = target else {
        println!("nothing to compact (retaining {} revisions)", policy.retain_revisions);
        return Ok(());
    };

    if args.dry_run {
        println!("would compact up to revision {}", target);
        return Ok(());
    }

    let compacted = engine.compact(target).await?;
    println!(
        "compacted up to revision {} ({} rows removed)",
        compacted.compact_revision, compacted.deleted_rows
    );
    Ok(())
}

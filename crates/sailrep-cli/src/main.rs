use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sailrep_sync::{engine_from_config, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sailrep")]
#[command(about = "Keeps the sail reporting table in step with the sail source tables")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation of the reporting table.
    Sync,
    /// Print what a sync would change, as JSON, without changing anything.
    Plan,
    /// Report event ids shared by several boat sails or by a boat and an individual sail.
    CheckDuplicates,
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SAILREP_LOG")
        .unwrap_or_else(|_| EnvFilter::new("sailrep=info,warn"));
    let format = env::var("SAILREP_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => registry.with(fmt::layer().json().with_ansi(false)).init(),
        _ => registry.with(fmt::layer().compact()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let engine = engine_from_config(&config)?;
            let summary = engine.run_once().await?;
            println!(
                "sync complete: run_id={} created={} deleted={} unchanged={}",
                summary.run_id,
                summary.created.len(),
                summary.deleted.len(),
                summary.retained
            );
        }
        Commands::Plan => {
            let engine = engine_from_config(&config)?;
            let plan = engine.plan().await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::CheckDuplicates => {
            let engine = engine_from_config(&config)?;
            let duplicates = engine.check_duplicates().await?;
            if duplicates.is_empty() {
                println!("no duplicate event ids");
            } else {
                println!("duplicate event ids: {}", duplicates.join(", "));
            }
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                anyhow::bail!("scheduler is disabled; set SAILREP_SCHEDULER_ENABLED=true");
            }
            let engine = Arc::new(engine_from_config(&config)?);
            let mut sched = sailrep_sync::build_scheduler(engine, &config.sync_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

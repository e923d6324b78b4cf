mod logger;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use xrate_core::IndicatorRecord;
use xrate_storage::{IndicatorStore, MemoryIndicatorStore};
use xrate_sync::{build_engine, connect_store, maybe_build_scheduler, SyncConfig};
use xrate_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "xrate-cli")]
#[command(about = "Exchange rate indicator sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass and exit.
    Sync {
        /// Apply into a process-local table instead of the database and print it.
        #[arg(long)]
        memory: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the admin surface, with the hourly job when enabled.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print every stored indicator.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_from_env()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { memory: false }) {
        Commands::Sync { memory } => {
            let outcome = if memory {
                let config = SyncConfig::from_env();
                let store = Arc::new(MemoryIndicatorStore::new());
                let engine = build_engine(&config, store.clone()).await?;
                let outcome = engine.run_sync_pass().await?;
                print_records(&store.list_all().await?);
                outcome
            } else {
                xrate_sync::run_sync_once_from_env().await?
            };
            println!(
                "sync complete: pass_id={} source={} status={:?} seen={} skipped={} inserted={} updated={} failed={}",
                outcome.pass_id,
                outcome.source_id,
                outcome.status(),
                outcome.seen,
                outcome.skipped,
                outcome.inserted,
                outcome.updated,
                outcome.failed
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            connect_store(&config).await?;
            println!("migrations applied");
        }
        Commands::Serve { port } => {
            let config = SyncConfig::from_env();
            let store = connect_store(&config).await?;
            let engine = build_engine(&config, Arc::new(store)).await?;

            let scheduler = maybe_build_scheduler(&config, engine.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduler started");
            }

            let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or_else(xrate_web::port_from_env)));
            tokio::select! {
                res = xrate_web::serve(AppState::new(engine), addr) => res?,
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
            }

            if let Some(mut sched) = scheduler {
                if let Err(err) = sched.shutdown().await {
                    warn!(error = %err, "scheduler shutdown failed");
                }
            }
        }
        Commands::List => {
            let config = SyncConfig::from_env();
            let store = connect_store(&config).await?;
            print_records(&store.list_all().await?);
        }
    }

    Ok(())
}

fn print_records(records: &[IndicatorRecord]) {
    for rec in records {
        println!(
            "{}\t{}\t{}\t{}\t{:.2}\t{}",
            rec.item_id, rec.name, rec.title, rec.price, rec.change_percent, rec.updated_at
        );
    }
}

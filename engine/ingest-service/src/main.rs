//! Ingest Service
//!
//! Runs scheduled batch ingestion until SIGINT/SIGTERM, or a single
//! ingestion with `--fetch N`.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use ingest_service::{
    graceful_shutdown, initialize_logging, load_configuration, setup_signal_handlers,
    wait_for_shutdown, ServiceState,
};

/// Batch ingestion service
#[derive(Parser)]
#[command(name = "ingest-service")]
#[command(about = "Rate-limited batch ingestion service", version)]
struct Cli {
    /// Path to a TOML configuration file (overrides INGEST_CONFIG_FILE)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Ingest this many records, print the final job and exit
    #[arg(long, value_name = "N")]
    fetch: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_configuration(cli.config)?;
    initialize_logging(&config.logging)?;

    info!("Starting Ingest Service v{}", env!("CARGO_PKG_VERSION"));

    let shutdown_timeout = config.service.shutdown_timeout();
    let state = ServiceState::new(config).await?;
    state.recover_orphaned_jobs().await?;

    if let Some(total_records) = cli.fetch {
        let job = state.run_once(total_records, Duration::from_secs(1)).await?;
        let snapshot = serde_json::to_string_pretty(&job).context("Failed to serialize job")?;
        println!("{}", snapshot);
        return Ok(());
    }

    let mut shutdown = setup_signal_handlers();
    let handles = state.start_background_tasks(shutdown.clone()).await;

    info!("Ingest Service is running. Press Ctrl+C to shutdown gracefully.");
    wait_for_shutdown(&mut shutdown).await;

    graceful_shutdown(handles, shutdown_timeout).await;
    info!("Ingest Service shutdown complete");
    Ok(())
}

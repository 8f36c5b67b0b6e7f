//! Ingest Service Library
//!
//! Configuration, logging, signal handling and process wiring for the
//! `ingest-service` binary, which runs the batch ingestion pipeline on a
//! schedule against Postgres and a randomuser.me-compatible source.

use anyhow::{Context, Result};
use std::path::PathBuf;

pub mod config;
pub mod cron;
pub mod logging;
pub mod service;
pub mod signals;

pub use config::ServiceConfig;
pub use cron::IngestionCron;
pub use logging::initialize_logging;
pub use service::{graceful_shutdown, ServiceState};
pub use signals::{setup_signal_handlers, wait_for_shutdown};

/// Load configuration from files and environment variables
pub fn load_configuration(path: Option<PathBuf>) -> Result<ServiceConfig> {
    config::load_config(path).context("Failed to load service configuration")
}

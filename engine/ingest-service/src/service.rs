//! Process wiring: stores, source, pipeline and background tasks

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use batch_ingest::postgres::PgStore;
use batch_ingest::{Collaborators, IngestionJob, IngestionService, RandomUserClient, SystemClock};

use crate::config::ServiceConfig;
use crate::cron::IngestionCron;
use crate::signals::wait_for_shutdown;

/// Running service and its background tasks
pub struct ServiceState {
    pub config: ServiceConfig,
    pub ingestion: Arc<IngestionService>,
}

impl ServiceState {
    /// Connect to Postgres, apply migrations and build the pipeline
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        let store = Arc::new(
            PgStore::connect(&config.database.url, config.database.max_connections)
                .await
                .context("Failed to connect to database")?,
        );
        store.migrate().await.context("Failed to apply database migrations")?;

        let source = RandomUserClient::new(config.source.http_timeout())
            .context("Failed to create HTTP client")?;

        let ingestion = IngestionService::new(
            Collaborators {
                source: Arc::new(source),
                records: store.clone(),
                jobs: store.clone(),
                config: store,
                clock: Arc::new(SystemClock),
            },
            config.retention.sweeper_config(),
        )
        .await;

        Ok(Self { config, ingestion: Arc::new(ingestion) })
    }

    /// Fail jobs a previous process left running, if configured
    pub async fn recover_orphaned_jobs(&self) -> Result<()> {
        if !self.config.service.fail_orphaned_on_startup {
            return Ok(());
        }
        let recovered = self
            .ingestion
            .recover_orphaned_jobs()
            .await
            .context("Failed to recover orphaned jobs")?;
        info!(recovered, "Orphaned job recovery completed");
        Ok(())
    }

    /// Start the periodic sweep and, if enabled, the ingestion cron
    pub async fn start_background_tasks(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let sweep = self.ingestion.sweeper().spawn_periodic();
        let mut sweep_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            wait_for_shutdown(&mut sweep_shutdown).await;
            sweep.abort();
            info!("Periodic retention sweep stopped");
        }));

        if self.config.cron.enabled {
            let cron = IngestionCron::new(self.ingestion.clone(), self.config.cron.clone());
            cron.initial_fetch().await;
            handles.push(cron.spawn(shutdown));
        } else {
            info!("Ingestion cron disabled");
        }

        handles
    }

    /// Run a single ingestion and wait for it to finish
    pub async fn run_once(&self, total_records: u64, poll_interval: Duration) -> Result<IngestionJob> {
        let job = self
            .ingestion
            .start_ingestion(total_records)
            .await
            .context("Failed to start ingestion")?;
        info!(job_id = %job.id, total_records, total_batches = job.total_batches, "One-shot ingestion started");

        if job.status.is_terminal() {
            return Ok(job);
        }
        self.wait_for_job(job.id, poll_interval).await
    }

    async fn wait_for_job(&self, job_id: Uuid, poll_interval: Duration) -> Result<IngestionJob> {
        loop {
            let job = self
                .ingestion
                .get_job_status(job_id)
                .await
                .context("Failed to read job status")?
                .with_context(|| format!("Job {} disappeared", job_id))?;

            if job.status.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Wait for background tasks to stop after shutdown was signalled
pub async fn graceful_shutdown(handles: Vec<JoinHandle<()>>, shutdown_timeout: Duration) {
    info!("Starting graceful shutdown...");

    for handle in handles {
        match timeout(shutdown_timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Background task panicked: {}", e),
            Err(_) => warn!("Background task did not stop within {:?}", shutdown_timeout),
        }
    }
}

//! Scheduled ingestion runs

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use batch_ingest::{IngestionJob, IngestionService};

use crate::config::CronConfig;

/// Starts an ingestion of `record_count` records every `interval`
pub struct IngestionCron {
    service: Arc<IngestionService>,
    config: CronConfig,
}

impl IngestionCron {
    pub fn new(service: Arc<IngestionService>, config: CronConfig) -> Self {
        Self { service, config }
    }

    /// Start one scheduled ingestion; failures are logged, never propagated
    pub async fn trigger(&self) -> Option<IngestionJob> {
        match self.service.start_ingestion(self.config.record_count).await {
            Ok(job) => {
                info!(
                    job_id = %job.id,
                    records = self.config.record_count,
                    total_batches = job.total_batches,
                    "scheduled ingestion started"
                );
                Some(job)
            }
            Err(e) => {
                error!(error = %e, "scheduled ingestion could not start");
                None
            }
        }
    }

    /// Seed an empty record store once at startup
    pub async fn initial_fetch(&self) -> Option<IngestionJob> {
        if !self.config.initial_fetch_when_empty {
            return None;
        }

        match self.service.count_records().await {
            Ok(0) => {
                info!("record store is empty, running initial ingestion");
                self.trigger().await
            }
            Ok(count) => {
                info!(count, "record store already populated, skipping initial ingestion");
                None
            }
            Err(e) => {
                error!(error = %e, "could not count stored records");
                None
            }
        }
    }

    /// Run the schedule until `shutdown` flips to `true`
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval_secs,
                records = self.config.record_count,
                "ingestion cron started"
            );

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.interval()) => {
                        self.trigger().await;
                    }
                    _ = crate::signals::wait_for_shutdown(&mut shutdown) => {
                        info!("ingestion cron stopped");
                        return;
                    }
                }
            }
        })
    }
}

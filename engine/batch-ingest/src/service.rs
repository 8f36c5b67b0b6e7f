//! Public entry point tying the pipeline together

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{ApiConfig, ApiConfigPatch, ConfigCache};
use crate::error::Result;
use crate::job::{IngestionJob, JobStatus};
use crate::queue::QueueStats;
use crate::scheduler::BatchScheduler;
use crate::source::RecordSource;
use crate::store::{ConfigStore, JobStore, RecordStore};
use crate::sweeper::{RetentionSweeper, SweeperConfig};

/// Error recorded on jobs that were still running when the process stopped
pub const ORPHANED_JOB_ERROR: &str = "process restarted before job completed";

/// External collaborators of an [`IngestionService`]
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn RecordSource>,
    pub records: Arc<dyn RecordStore>,
    pub jobs: Arc<dyn JobStore>,
    pub config: Arc<dyn ConfigStore>,
    pub clock: Arc<dyn Clock>,
}

/// Starts ingestion jobs, reports their progress and manages the tunables
pub struct IngestionService {
    scheduler: BatchScheduler,
    config: Arc<ConfigCache>,
    jobs: Arc<dyn JobStore>,
    records: Arc<dyn RecordStore>,
    sweeper: Arc<RetentionSweeper>,
    clock: Arc<dyn Clock>,
}

impl IngestionService {
    /// Wire the pipeline and run one retention sweep before accepting work
    pub async fn new(deps: Collaborators, sweeper_config: SweeperConfig) -> Self {
        let config = Arc::new(ConfigCache::new(deps.config));
        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::clone(&deps.jobs),
            Arc::clone(&deps.clock),
            sweeper_config,
        ));

        let scheduler = BatchScheduler::new(
            deps.source,
            Arc::clone(&deps.records),
            Arc::clone(&deps.jobs),
            Arc::clone(&config),
            Arc::clone(&deps.clock),
        )
        .with_sweeper(Arc::clone(&sweeper));

        sweeper.run_once().await;

        Self {
            scheduler,
            config,
            jobs: deps.jobs,
            records: deps.records,
            sweeper,
            clock: deps.clock,
        }
    }

    /// Accept a request for `total_records` records and return the job's
    /// initial snapshot.
    ///
    /// Processing continues in the background; poll [`Self::get_job_status`].
    pub async fn start_ingestion(&self, total_records: u64) -> Result<IngestionJob> {
        self.scheduler.fetch_and_store(total_records).await
    }

    /// Snapshot of a job, `None` if the id is unknown or was swept
    pub async fn get_job_status(&self, job_id: Uuid) -> Result<Option<IngestionJob>> {
        self.jobs.find_by_id(job_id).await
    }

    /// Merge `patch` onto the persisted tunables; running jobs pick up the
    /// new endpoint and rate on their next batch
    pub async fn update_config(&self, patch: &ApiConfigPatch) -> Result<ApiConfig> {
        self.config.update(patch).await
    }

    pub async fn current_config(&self) -> Result<ApiConfig> {
        self.config.get().await
    }

    pub async fn count_records(&self) -> Result<u64> {
        self.records.count().await
    }

    /// Fail every job left `running` by a previous process.
    ///
    /// Call once at startup, before any new job is started.
    pub async fn recover_orphaned_jobs(&self) -> Result<usize> {
        let orphans = self.jobs.find_by_status(JobStatus::Running).await?;
        let mut recovered = 0;

        for job in orphans {
            match self
                .jobs
                .set_status(job.id, JobStatus::Failed, Some(ORPHANED_JOB_ERROR.to_string()), self.clock.now())
                .await
            {
                Ok(()) => recovered += 1,
                Err(e) => warn!(job_id = %job.id, error = %e, "could not fail orphaned job"),
            }
        }

        if recovered > 0 {
            info!(recovered, "failed orphaned ingestion jobs");
        }
        Ok(recovered)
    }

    pub fn sweeper(&self) -> &Arc<RetentionSweeper> {
        &self.sweeper
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.scheduler.queue().stats()
    }
}

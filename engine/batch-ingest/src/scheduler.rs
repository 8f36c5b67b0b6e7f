//! Batch planning and the per-job scheduling loop

use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{ApiConfig, ConfigCache};
use crate::error::{IngestError, Result};
use crate::job::{IngestionJob, JobStatus};
use crate::models::transform_batch;
use crate::queue::TaskQueue;
use crate::rate_limiter::RateLimiter;
use crate::source::RecordSource;
use crate::store::{JobStore, RecordStore};
use crate::sweeper::RetentionSweeper;

/// Split of a record volume into fixed-size batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    total_records: u64,
    batch_size: u32,
    total_batches: u32,
}

impl BatchPlan {
    pub fn new(total_records: u64, batch_size: u32) -> Result<Self> {
        if batch_size == 0 {
            return Err(IngestError::config("batch size must be at least 1"));
        }
        let total_batches = u32::try_from(total_records.div_ceil(u64::from(batch_size)))
            .map_err(|_| {
                IngestError::config(format!(
                    "{total_records} records in batches of {batch_size} is too many batches"
                ))
            })?;

        Ok(Self { total_records, batch_size, total_batches })
    }

    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// `ceil(total_records / batch_size)`
    pub fn total_batches(&self) -> u32 {
        self.total_batches
    }

    /// Size of batch `index`; only the last batch can be short
    pub fn batch_len(&self, index: u32) -> u32 {
        let offset = u64::from(index) * u64::from(self.batch_size);
        let remaining = self.total_records.saturating_sub(offset);
        remaining.min(u64::from(self.batch_size)) as u32
    }

    pub fn batch_sizes(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.total_batches).map(move |index| self.batch_len(index))
    }
}

/// Drives one queue task per batch for every accepted job
#[derive(Clone)]
pub struct BatchScheduler {
    queue: TaskQueue,
    limiter: Arc<RateLimiter>,
    source: Arc<dyn RecordSource>,
    records: Arc<dyn RecordStore>,
    jobs: Arc<dyn JobStore>,
    config: Arc<ConfigCache>,
    clock: Arc<dyn Clock>,
    sweeper: Option<Arc<RetentionSweeper>>,
}

impl BatchScheduler {
    pub fn new(
        source: Arc<dyn RecordSource>,
        records: Arc<dyn RecordStore>,
        jobs: Arc<dyn JobStore>,
        config: Arc<ConfigCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue: TaskQueue::new(),
            limiter: Arc::new(RateLimiter::new(Arc::clone(&clock))),
            source,
            records,
            jobs,
            config,
            clock,
            sweeper: None,
        }
    }

    /// Schedule a one-shot sweep whenever a job completes
    pub fn with_sweeper(mut self, sweeper: Arc<RetentionSweeper>) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Create a job for `total_records` and process it in the background.
    ///
    /// Returns as soon as the job row exists. Batch size and cooldowns are
    /// read once here; later config updates do not affect this job.
    pub async fn fetch_and_store(&self, total_records: u64) -> Result<IngestionJob> {
        let config = self.config.get().await?;
        let plan = BatchPlan::new(total_records, config.batch_size)?;

        let job = self.jobs.create(&IngestionJob::new(plan.total_batches(), self.clock.now())).await?;
        info!(
            job_id = %job.id,
            total_records,
            batch_size = plan.batch_size(),
            total_batches = plan.total_batches(),
            "ingestion job started"
        );

        let scheduler = self.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            scheduler.run_job(job_id, plan, config).await;
        });

        Ok(job)
    }

    async fn run_job(self, job_id: Uuid, plan: BatchPlan, config: ApiConfig) {
        let window = config.requests_per_second.max(1);

        for (index, size) in plan.batch_sizes().enumerate() {
            let label = format!("job {job_id} batch {}/{}", index + 1, plan.total_batches());
            let handle = self.queue.submit(label, self.clone().run_batch(job_id, size));

            if let Err(e) = handle.await {
                self.fail_job(job_id, index, &e).await;
                return;
            }

            if index > 0 && index as u32 % window == 0 {
                debug!(job_id = %job_id, batch = index, "inter-window cooldown");
                self.clock.sleep(config.sleep_time()).await;
            }
            self.clock.sleep(config.batch_sleep()).await;
        }

        self.complete_job(job_id, plan).await;
    }

    /// Fetch, transform and store one batch, then bump the job counters
    async fn run_batch(self, job_id: Uuid, size: u32) -> Result<u64> {
        let api = self.config.get().await?;

        let raw = self
            .limiter
            .call(api.requests_per_second, || self.source.fetch(&api.base_url, size))
            .await?;
        let users = transform_batch(&raw)?;
        let inserted = self.records.insert_many(&users).await?;

        self.jobs.increment_counters(job_id, 1, self.clock.now()).await?;
        debug!(job_id = %job_id, requested = size, inserted, "batch stored");
        Ok(inserted)
    }

    async fn fail_job(&self, job_id: Uuid, batch: usize, cause: &IngestError) {
        let message = cause.detail();
        error!(job_id = %job_id, batch, error = %message, "ingestion job failed");

        if let Err(e) = self
            .jobs
            .set_status(job_id, JobStatus::Failed, Some(message), self.clock.now())
            .await
        {
            error!(job_id = %job_id, error = %e, "failed to record job failure");
        }
    }

    async fn complete_job(&self, job_id: Uuid, plan: BatchPlan) {
        match self.jobs.set_status(job_id, JobStatus::Completed, None, self.clock.now()).await {
            Ok(()) => {
                info!(
                    job_id = %job_id,
                    total_records = plan.total_records(),
                    total_batches = plan.total_batches(),
                    "ingestion job completed"
                );
                if let Some(sweeper) = &self.sweeper {
                    sweeper.schedule_after_job();
                }
            }
            Err(e) => error!(job_id = %job_id, error = %e, "failed to mark job completed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plan_for_250_records_of_100() {
        let plan = BatchPlan::new(250, 100).unwrap();
        assert_eq!(plan.total_batches(), 3);
        assert_eq!(plan.batch_sizes().collect::<Vec<_>>(), vec![100, 100, 50]);
    }

    #[test]
    fn test_plan_exact_multiple_and_empty() {
        let plan = BatchPlan::new(300, 100).unwrap();
        assert_eq!(plan.batch_sizes().collect::<Vec<_>>(), vec![100, 100, 100]);

        let empty = BatchPlan::new(0, 100).unwrap();
        assert_eq!(empty.total_batches(), 0);
        assert_eq!(empty.batch_sizes().count(), 0);
    }

    #[test]
    fn test_plan_rejects_zero_batch_size() {
        assert!(matches!(BatchPlan::new(10, 0), Err(IngestError::Config(_))));
    }

    #[test]
    fn test_plan_rejects_batch_count_overflow() {
        assert!(BatchPlan::new(u64::MAX, 1).is_err());
    }

    proptest! {
        #[test]
        fn prop_batches_cover_total_exactly(total in 0u64..200_000, batch_size in 1u32..2_000) {
            let plan = BatchPlan::new(total, batch_size).unwrap();
            let sizes: Vec<u32> = plan.batch_sizes().collect();

            prop_assert_eq!(u64::from(plan.total_batches()), total.div_ceil(u64::from(batch_size)));
            prop_assert_eq!(sizes.iter().map(|s| u64::from(*s)).sum::<u64>(), total);
            prop_assert!(sizes.iter().all(|s| *s >= 1 && *s <= batch_size));
            if let Some((last, full)) = sizes.split_last() {
                prop_assert!(full.iter().all(|s| *s == batch_size));
                prop_assert!(*last <= batch_size);
            }
        }
    }
}

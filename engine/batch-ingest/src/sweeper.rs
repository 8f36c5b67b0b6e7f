//! Retention sweep for old job records

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::error::{IngestError, Result};
use crate::job::JobFilter;
use crate::store::JobStore;

/// Default retention window (24h)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default periodic sweep interval (1h)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Sweeper configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Jobs not updated for longer than this are deleted
    pub retention: Duration,

    /// Interval of the periodic sweep
    pub interval: Duration,

    /// Delay of the one-shot sweep after a job completes (`None` disables it)
    pub post_job_delay: Option<Duration>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            interval: DEFAULT_SWEEP_INTERVAL,
            post_job_delay: Some(DEFAULT_RETENTION),
        }
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Completed or failed jobs removed
    pub terminal_deleted: u64,

    /// Running jobs removed because they stopped making progress
    pub stale_deleted: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.terminal_deleted + self.stale_deleted
    }
}

/// Deletes terminal and stale jobs older than the retention window
pub struct RetentionSweeper {
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl RetentionSweeper {
    pub fn new(jobs: Arc<dyn JobStore>, clock: Arc<dyn Clock>, config: SweeperConfig) -> Self {
        Self { jobs, clock, config }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Delete old terminal jobs, then stale running ones
    pub async fn sweep(&self) -> Result<SweepReport> {
        let cutoff = chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| self.clock.now().checked_sub_signed(retention))
            .ok_or_else(|| {
                IngestError::config(format!(
                    "retention window of {}s reaches before the earliest representable time",
                    self.config.retention.as_secs()
                ))
            })?;

        let terminal_deleted = self.jobs.delete_many(&JobFilter::terminal_before(cutoff)).await?;
        let stale_deleted = self.jobs.delete_many(&JobFilter::stale_before(cutoff)).await?;

        Ok(SweepReport { terminal_deleted, stale_deleted })
    }

    /// Best-effort sweep: failures are logged and reported as nothing deleted
    pub async fn run_once(&self) -> SweepReport {
        match self.sweep().await {
            Ok(report) => {
                if report.total() > 0 {
                    info!(
                        terminal_deleted = report.terminal_deleted,
                        stale_deleted = report.stale_deleted,
                        "retention sweep removed old jobs"
                    );
                } else {
                    debug!("retention sweep found nothing to remove");
                }
                report
            }
            Err(e) => {
                error!(error = %e, "retention sweep failed");
                SweepReport::default()
            }
        }
    }

    /// Sweep once after `delay`
    pub fn schedule_once(self: &Arc<Self>, delay: Duration) -> JoinHandle<SweepReport> {
        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            sweeper.clock.sleep(delay).await;
            sweeper.run_once().await
        })
    }

    /// One-shot sweep following a job's completion, if enabled
    pub fn schedule_after_job(self: &Arc<Self>) -> Option<JoinHandle<SweepReport>> {
        self.config.post_job_delay.map(|delay| self.schedule_once(delay))
    }

    /// Sweep every `interval`, forever
    pub fn spawn_periodic(self: &Arc<Self>) -> JoinHandle<()> {
        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = sweeper.config.interval.as_secs(), "periodic retention sweep started");
            loop {
                sweeper.clock.sleep(sweeper.config.interval).await;
                sweeper.run_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::{IngestionJob, JobStatus};
    use crate::memory::InMemoryJobStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    fn job_touched_at(status: JobStatus, hours_ago: i64, now: DateTime<Utc>) -> IngestionJob {
        let touched = now - chrono::Duration::hours(hours_ago);
        let mut job = IngestionJob::new(1, touched);
        if status != JobStatus::Running {
            job.transition(status, Some("boom".into()), touched).unwrap();
        }
        job
    }

    fn sweeper(store: Arc<InMemoryJobStore>, clock: Arc<ManualClock>) -> Arc<RetentionSweeper> {
        Arc::new(RetentionSweeper::new(store, clock, SweeperConfig::default()))
    }

    #[tokio::test]
    async fn test_retention_boundary() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryJobStore::new());
        let now = clock.now();

        let expired = job_touched_at(JobStatus::Completed, 25, now);
        let kept = job_touched_at(JobStatus::Completed, 23, now);
        store.put(expired.clone());
        store.put(kept.clone());

        let report = sweeper(store.clone(), clock).sweep().await.unwrap();

        assert_eq!(report, SweepReport { terminal_deleted: 1, stale_deleted: 0 });
        assert!(store.find_by_id(expired.id).await.unwrap().is_none());
        assert!(store.find_by_id(kept.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_and_stale_running_jobs_are_removed() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryJobStore::new());
        let now = clock.now();

        store.put(job_touched_at(JobStatus::Failed, 48, now));
        store.put(job_touched_at(JobStatus::Running, 30, now));
        let active = job_touched_at(JobStatus::Running, 1, now);
        store.put(active.clone());

        let report = sweeper(store.clone(), clock).run_once().await;

        assert_eq!(report, SweepReport { terminal_deleted: 1, stale_deleted: 1 });
        assert_eq!(store.len(), 1);
        assert!(store.find_by_id(active.id).await.unwrap().is_some());
    }

    struct BrokenStore;

    #[async_trait]
    impl JobStore for BrokenStore {
        async fn create(&self, _job: &IngestionJob) -> Result<IngestionJob> {
            Err(IngestError::storage("connection refused"))
        }
        async fn increment_counters(&self, _id: Uuid, _delta: u32, _now: DateTime<Utc>) -> Result<()> {
            Err(IngestError::storage("connection refused"))
        }
        async fn set_status(
            &self,
            _id: Uuid,
            _status: JobStatus,
            _error: Option<String>,
            _now: DateTime<Utc>,
        ) -> Result<()> {
            Err(IngestError::storage("connection refused"))
        }
        async fn find_by_id(&self, _id: Uuid) -> Result<Option<IngestionJob>> {
            Err(IngestError::storage("connection refused"))
        }
        async fn find_by_status(&self, _status: JobStatus) -> Result<Vec<IngestionJob>> {
            Err(IngestError::storage("connection refused"))
        }
        async fn delete_many(&self, _filter: &JobFilter) -> Result<u64> {
            Err(IngestError::storage("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let sweeper = RetentionSweeper::new(
            Arc::new(BrokenStore),
            Arc::new(ManualClock::default()),
            SweeperConfig::default(),
        );

        assert!(sweeper.sweep().await.is_err());
        assert_eq!(sweeper.run_once().await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_oversized_retention_is_a_config_error() {
        let store = Arc::new(InMemoryJobStore::new());
        let clock = Arc::new(ManualClock::default());
        store.put(job_touched_at(JobStatus::Completed, 48, clock.now()));

        let config = SweeperConfig { retention: Duration::from_secs(u64::MAX), ..SweeperConfig::default() };
        let sweeper = RetentionSweeper::new(store.clone(), clock, config);

        assert!(matches!(sweeper.sweep().await, Err(IngestError::Config(_))));
        assert_eq!(sweeper.run_once().await, SweepReport::default());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_sweep_waits_for_delay() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryJobStore::new());
        let now = clock.now();

        // 23h old now, 25h old once the 2h delay has elapsed
        let job = job_touched_at(JobStatus::Completed, 23, now);
        store.put(job.clone());

        let report = sweeper(store.clone(), clock.clone())
            .schedule_once(Duration::from_secs(2 * 60 * 60))
            .await
            .unwrap();

        assert_eq!(report.terminal_deleted, 1);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2 * 60 * 60)]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_post_job_sweep_can_be_disabled() {
        let config = SweeperConfig { post_job_delay: None, ..SweeperConfig::default() };
        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(ManualClock::default()),
            config,
        ));

        assert!(sweeper.schedule_after_job().is_none());
    }
}

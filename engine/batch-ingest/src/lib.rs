//! Batch Ingest - rate-limited batch ingestion with persisted job progress
//!
//! A caller asks for N records. The [`IngestionService`] splits the request
//! into fixed-size batches and runs them one at a time on a shared
//! [`TaskQueue`]. Every external call passes through the [`RateLimiter`], and
//! progress lands in a [`JobStore`] that pollers can read while the job runs.
//! Old jobs are removed by the [`RetentionSweeper`].
//!
//! Storage sits behind the traits in [`store`], with in-memory
//! implementations in [`memory`] and Postgres ones in [`postgres`].

pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod queue;
pub mod rate_limiter;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod store;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ApiConfig, ApiConfigPatch, ConfigCache, DEFAULT_CONFIG_KEY};
pub use error::{IngestError, Result};
pub use job::{IngestionJob, JobFilter, JobStatus};
pub use models::{transform_batch, transform_user, UserRecord};
pub use queue::{QueueStats, TaskHandle, TaskQueue};
pub use rate_limiter::{RateLimitInfo, RateLimiter};
pub use scheduler::{BatchPlan, BatchScheduler};
pub use service::{Collaborators, IngestionService, ORPHANED_JOB_ERROR};
pub use source::{RandomUserClient, RecordSource};
pub use store::{ConfigStore, JobStore, RecordStore};
pub use sweeper::{RetentionSweeper, SweepReport, SweeperConfig};

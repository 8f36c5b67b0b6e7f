//! Storage traits consumed by the pipeline
//!
//! Two implementations ship with the crate: [`crate::memory`] for tests and
//! single-process runs without a database, and [`crate::postgres`] for
//! production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::error::Result;
use crate::job::{IngestionJob, JobFilter, JobStatus};
use crate::models::UserRecord;

/// Persisted job progress records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job and return it as stored
    async fn create(&self, job: &IngestionJob) -> Result<IngestionJob>;

    /// Atomically move `delta` batches from pending to completed.
    ///
    /// Fails with `InvalidTransition` if the job is no longer running and
    /// with `JobNotFound` if it does not exist.
    async fn increment_counters(&self, id: Uuid, delta: u32, now: DateTime<Utc>) -> Result<()>;

    /// Move a running job to a terminal status
    async fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<IngestionJob>>;

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<IngestionJob>>;

    /// Delete every job matching `filter`, returning how many were removed
    async fn delete_many(&self, filter: &JobFilter) -> Result<u64>;
}

/// Bulk storage for ingested records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert all records, returning how many were written
    async fn insert_many(&self, records: &[UserRecord]) -> Result<u64>;

    /// Number of stored records
    async fn count(&self) -> Result<u64>;
}

/// Persisted ingestion tunables, one row per key
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn find_by_key(&self, key: &str) -> Result<Option<ApiConfig>>;

    /// Insert `config` under `key` unless a row already exists.
    ///
    /// Returns `None` when another writer got there first.
    async fn create(&self, key: &str, config: &ApiConfig) -> Result<Option<ApiConfig>>;

    /// Insert or replace the row under `key`
    async fn upsert(&self, key: &str, config: &ApiConfig) -> Result<()>;
}

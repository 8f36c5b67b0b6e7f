//! In-process stores, used by tests and database-less runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::error::{IngestError, Result};
use crate::job::{IngestionJob, JobFilter, JobStatus};
use crate::models::UserRecord;
use crate::store::{ConfigStore, JobStore, RecordStore};

/// Job store backed by a map; every operation runs under one lock
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, IngestionJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a job as-is (for seeding)
    pub fn put(&self, job: IngestionJob) {
        self.jobs.lock().insert(job.id, job);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &IngestionJob) -> Result<IngestionJob> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(IngestError::storage(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(job.clone())
    }

    async fn increment_counters(&self, id: Uuid, delta: u32, now: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&id).ok_or(IngestError::JobNotFound(id))?;
        job.record_completed(delta, now)
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&id).ok_or(IngestError::JobNotFound(id))?;
        job.transition(status, error, now)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<IngestionJob>> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<IngestionJob>> {
        let mut found: Vec<_> =
            self.jobs.lock().values().filter(|job| job.status == status).cloned().collect();
        found.sort_by_key(|job| job.started_at);
        Ok(found)
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, job| !filter.matches(job));
        Ok((before - jobs.len()) as u64)
    }
}

/// Record store backed by a vector
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<Vec<UserRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything stored so far, in insertion order
    pub fn records(&self) -> Vec<UserRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_many(&self, records: &[UserRecord]) -> Result<u64> {
        self.records.lock().extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.records.lock().len() as u64)
    }
}

/// Config store backed by a map
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    rows: Mutex<HashMap<String, ApiConfig>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn find_by_key(&self, key: &str) -> Result<Option<ApiConfig>> {
        Ok(self.rows.lock().get(key).cloned())
    }

    async fn create(&self, key: &str, config: &ApiConfig) -> Result<Option<ApiConfig>> {
        let mut rows = self.rows.lock();
        if rows.contains_key(key) {
            return Ok(None);
        }
        rows.insert(key.to_string(), config.clone());
        Ok(Some(config.clone()))
    }

    async fn upsert(&self, key: &str, config: &ApiConfig) -> Result<()> {
        self.rows.lock().insert(key.to_string(), config.clone());
        Ok(())
    }
}

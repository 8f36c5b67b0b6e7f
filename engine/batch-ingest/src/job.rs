//! Ingestion job progress record and its state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{IngestError, Result};

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    /// Only `running -> completed` and `running -> failed` are allowed
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!((self, next), (JobStatus::Running, JobStatus::Completed | JobStatus::Failed))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(IngestError::storage(format!("unknown job status '{other}'"))),
        }
    }
}

/// Persisted progress of one ingestion run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionJob {
    pub id: Uuid,
    pub total_batches: u32,
    pub completed_batches: u32,
    pub pending_batches: u32,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionJob {
    /// Fresh running job with every batch pending
    pub fn new(total_batches: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            total_batches,
            completed_batches: 0,
            pending_batches: total_batches,
            status: JobStatus::Running,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Record `delta` more finished batches.
    ///
    /// Used by the in-memory store; the Postgres store does the same
    /// arithmetic in a single `UPDATE`.
    pub fn record_completed(&mut self, delta: u32, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(IngestError::InvalidTransition { from: self.status, to: JobStatus::Running });
        }
        let delta = delta.min(self.pending_batches);
        self.completed_batches += delta;
        self.pending_batches -= delta;
        self.updated_at = now;
        Ok(())
    }

    /// Move to a terminal status.
    ///
    /// `pending_batches` is left as-is on failure so pollers can see how much
    /// work was abandoned.
    pub fn transition(
        &mut self,
        next: JobStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(IngestError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        self.error = match next {
            JobStatus::Failed => Some(error.unwrap_or_else(|| "unknown error".to_string())),
            _ => None,
        };
        self.updated_at = now;
        Ok(())
    }

    /// `completed + pending == total` while running
    pub fn counters_consistent(&self) -> bool {
        self.completed_batches + self.pending_batches == self.total_batches
    }
}

/// Selects jobs for bulk deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub updated_before: DateTime<Utc>,
}

impl JobFilter {
    /// Terminal jobs last touched before `cutoff`
    pub fn terminal_before(cutoff: DateTime<Utc>) -> Self {
        Self { statuses: vec![JobStatus::Completed, JobStatus::Failed], updated_before: cutoff }
    }

    /// Running jobs last touched before `cutoff`
    pub fn stale_before(cutoff: DateTime<Utc>) -> Self {
        Self { statuses: vec![JobStatus::Running], updated_before: cutoff }
    }

    pub fn matches(&self, job: &IngestionJob) -> bool {
        self.statuses.contains(&job.status) && job.updated_at < self.updated_before
    }
}

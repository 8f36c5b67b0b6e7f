//! Error types for the ingestion pipeline

use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Result type for ingestion pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors that can occur in the ingestion pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Task aborted before completion")]
    TaskAborted,
}

impl IngestError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new transform error
    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    /// Human-readable message recorded on a failed job.
    ///
    /// Drops the category prefix so a poller sees `disk full` rather than
    /// `Storage error: disk full`.
    pub fn detail(&self) -> String {
        match self {
            Self::Config(msg)
            | Self::Transport(msg)
            | Self::Storage(msg)
            | Self::Transform(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Storage(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for IngestError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        IngestError::Storage(format!("migration failed: {err}"))
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_strips_category() {
        let err = IngestError::storage("disk full");
        assert_eq!(err.to_string(), "Storage error: disk full");
        assert_eq!(err.detail(), "disk full");
    }

    #[test]
    fn test_detail_keeps_full_message_for_structured_variants() {
        let id = Uuid::new_v4();
        let err = IngestError::JobNotFound(id);
        assert_eq!(err.detail(), format!("Job not found: {id}"));
    }
}

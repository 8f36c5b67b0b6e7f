//! Postgres-backed stores

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::info;
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::error::{IngestError, Result};
use crate::job::{IngestionJob, JobFilter, JobStatus};
use crate::models::UserRecord;
use crate::store::{ConfigStore, JobStore, RecordStore};

/// Rows per INSERT statement; 9 binds per row keeps us well under the
/// Postgres bind parameter limit.
const INSERT_CHUNK_ROWS: usize = 1000;

const JOB_COLUMNS: &str = "id, total_batches, completed_batches, pending_batches, status, error, started_at, updated_at";

const CONFIG_COLUMNS: &str = "base_url, requests_per_second, sleep_time_ms, batch_size, batch_sleep_ms";

/// Job, record and config store over one connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!(max_connections, "connected to database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explain why a guarded UPDATE on a job touched no rows
    async fn missed_update(&self, id: Uuid, attempted: JobStatus) -> IngestError {
        match self.find_by_id(id).await {
            Ok(Some(job)) => IngestError::InvalidTransition { from: job.status, to: attempted },
            Ok(None) => IngestError::JobNotFound(id),
            Err(e) => e,
        }
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    total_batches: i32,
    completed_batches: i32,
    pending_batches: i32,
    status: String,
    error: Option<String>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for IngestionJob {
    type Error = IngestError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(IngestionJob {
            id: row.id,
            total_batches: from_db_int(row.total_batches, "total_batches")?,
            completed_batches: from_db_int(row.completed_batches, "completed_batches")?,
            pending_batches: from_db_int(row.pending_batches, "pending_batches")?,
            status: row.status.parse()?,
            error: row.error,
            started_at: row.started_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConfigRow {
    base_url: String,
    requests_per_second: i32,
    sleep_time_ms: i64,
    batch_size: i32,
    batch_sleep_ms: i64,
}

impl TryFrom<ConfigRow> for ApiConfig {
    type Error = IngestError;

    fn try_from(row: ConfigRow) -> Result<Self> {
        Ok(ApiConfig {
            base_url: row.base_url,
            requests_per_second: from_db_int(row.requests_per_second, "requests_per_second")?,
            sleep_time: u64::try_from(row.sleep_time_ms)
                .map_err(|_| IngestError::storage("negative sleep_time_ms in api_config"))?,
            batch_size: from_db_int(row.batch_size, "batch_size")?,
            batch_sleep: u64::try_from(row.batch_sleep_ms)
                .map_err(|_| IngestError::storage("negative batch_sleep_ms in api_config"))?,
        })
    }
}

fn from_db_int(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| IngestError::storage(format!("negative value in column {column}")))
}

fn to_db_int(value: u32, column: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| IngestError::storage(format!("{column} out of range: {value}")))
}

fn to_db_bigint(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| IngestError::storage(format!("{column} out of range: {value}")))
}

#[async_trait]
impl JobStore for PgStore {
    async fn create(&self, job: &IngestionJob) -> Result<IngestionJob> {
        let row: JobRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO ingestion_jobs ({JOB_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(to_db_int(job.total_batches, "total_batches")?)
        .bind(to_db_int(job.completed_batches, "completed_batches")?)
        .bind(to_db_int(job.pending_batches, "pending_batches")?)
        .bind(job.status.as_str())
        .bind(job.error.as_deref())
        .bind(job.started_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn increment_counters(&self, id: Uuid, delta: u32, now: DateTime<Utc>) -> Result<()> {
        // Both SET expressions read the pre-update row, so LEAST clamps them identically.
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET completed_batches = completed_batches + LEAST($2, pending_batches),
                pending_batches = pending_batches - LEAST($2, pending_batches),
                updated_at = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(to_db_int(delta, "delta")?)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.missed_update(id, JobStatus::Running).await);
        }
        Ok(())
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !JobStatus::Running.can_transition_to(status) {
            return Err(IngestError::InvalidTransition { from: JobStatus::Running, to: status });
        }
        let error = match status {
            JobStatus::Failed => Some(error.unwrap_or_else(|| "unknown error".to_string())),
            _ => None,
        };

        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = $2, error = $3, updated_at = $4
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.missed_update(id, status).await);
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<IngestionJob>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(IngestionJob::try_from).transpose()
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<IngestionJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE status = $1 ORDER BY started_at"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IngestionJob::try_from).collect()
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64> {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();

        let result = sqlx::query(
            "DELETE FROM ingestion_jobs WHERE status = ANY($1) AND updated_at < $2",
        )
        .bind(statuses)
        .bind(filter.updated_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn insert_many(&self, records: &[UserRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO users (gender, name, city, state, country, street, email, age, picture) ",
            );
            builder.push_values(chunk, |mut row, user| {
                row.push_bind(user.gender.clone())
                    .push_bind(user.name.clone())
                    .push_bind(user.address.city.clone())
                    .push_bind(user.address.state.clone())
                    .push_bind(user.address.country.clone())
                    .push_bind(user.address.street.clone())
                    .push_bind(user.email.clone())
                    .push_bind(user.age.clone())
                    .push_bind(user.picture.clone());
            });

            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn find_by_key(&self, key: &str) -> Result<Option<ApiConfig>> {
        let row: Option<ConfigRow> =
            sqlx::query_as(&format!("SELECT {CONFIG_COLUMNS} FROM api_config WHERE key = $1"))
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        row.map(ApiConfig::try_from).transpose()
    }

    async fn create(&self, key: &str, config: &ApiConfig) -> Result<Option<ApiConfig>> {
        let row: Option<ConfigRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO api_config (key, {CONFIG_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (key) DO NOTHING
            RETURNING {CONFIG_COLUMNS}
            "#
        ))
        .bind(key)
        .bind(&config.base_url)
        .bind(to_db_int(config.requests_per_second, "requests_per_second")?)
        .bind(to_db_bigint(config.sleep_time, "sleep_time")?)
        .bind(to_db_int(config.batch_size, "batch_size")?)
        .bind(to_db_bigint(config.batch_sleep, "batch_sleep")?)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ApiConfig::try_from).transpose()
    }

    async fn upsert(&self, key: &str, config: &ApiConfig) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO api_config (key, {CONFIG_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (key) DO UPDATE SET
                base_url = EXCLUDED.base_url,
                requests_per_second = EXCLUDED.requests_per_second,
                sleep_time_ms = EXCLUDED.sleep_time_ms,
                batch_size = EXCLUDED.batch_size,
                batch_sleep_ms = EXCLUDED.batch_sleep_ms,
                updated_at = NOW()
            "#
        ))
        .bind(key)
        .bind(&config.base_url)
        .bind(to_db_int(config.requests_per_second, "requests_per_second")?)
        .bind(to_db_bigint(config.sleep_time, "sleep_time")?)
        .bind(to_db_int(config.batch_size, "batch_size")?)
        .bind(to_db_bigint(config.batch_sleep, "batch_sleep")?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

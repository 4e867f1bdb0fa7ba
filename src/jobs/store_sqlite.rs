/*!
SQLite job store

Async implementation of the [`JobStore`] trait backed by SQLite, for durable
checkpoint queues on single-node hosts.

## Behavior

- Uses the serde persistence models (see `jobs::persistence`) for the job
  payload column.
- When the `sqlite-migrations` feature is enabled (default), embedded
  migrations (`sqlx::migrate!("./migrations")`) run on connect; disabling the
  feature assumes external migration orchestration.

## Schema

- `checkpoint_jobs(id, payload, attempts, status, last_error, checkpoint_id, queued_at, updated_at)`
- `checkpoint_job_dead_letters(...)` same shape
- `recovery_data(id=1, data, recorded_at)` single-row shutdown handoff
*/

use std::sync::Arc;

use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::instrument;

use super::persistence::{payload_from_json, payload_to_json, JobStore, RecoveryData};
use super::types::{CheckpointJob, JobStatus};
use crate::errors::{CoordError, Result};
use crate::utils::json_ext::{deserialize_json, serialize_json};

/// SQLite-backed job store.
pub struct SqliteJobStore {
    /// Shared connection pool for concurrent queue operations.
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore").finish()
    }
}

impl SqliteJobStore {
    /// Connect (or create) a SQLite database at `database_url`.
    /// Example URL: "sqlite://sessionweave.db?mode=rwc"
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| CoordError::backend(format!("sqlite connect: {e}")))?;
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(CoordError::backend(format!("sqlite migration: {e}")));
            }
        }
        #[cfg(not(feature = "sqlite-migrations"))]
        {
            // Feature disabled: schema is applied by external orchestration.
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn row_to_job(row: &SqliteRow) -> Result<CheckpointJob> {
        let payload_raw: String = row.get("payload");
        let status_raw: String = row.get("status");
        let status = JobStatus::parse(&status_raw).ok_or_else(|| CoordError::Validation {
            message: format!("unknown job status in store: {status_raw}"),
        })?;
        let queued_at_raw: String = row.get("queued_at");
        let updated_at_raw: String = row.get("updated_at");
        let parse_ts = |raw: &str| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now())
        };
        Ok(CheckpointJob {
            id: row.get("id"),
            payload: payload_from_json(&payload_raw)?,
            attempts: row.get::<i64, _>("attempts") as u32,
            status,
            last_error: row.get("last_error"),
            checkpoint_id: row.get("checkpoint_id"),
            queued_at: parse_ts(&queued_at_raw),
            updated_at: parse_ts(&updated_at_raw),
        })
    }

    async fn upsert(&self, table: &str, job: &CheckpointJob) -> Result<()> {
        let payload = payload_to_json(&job.payload)?;
        let sql = format!(
            r#"
            INSERT INTO {table} (id, payload, attempts, status, last_error, checkpoint_id, queued_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                attempts = excluded.attempts,
                status = excluded.status,
                last_error = excluded.last_error,
                checkpoint_id = excluded.checkpoint_id,
                updated_at = excluded.updated_at
            "#
        );
        sqlx::query(&sql)
            .bind(&job.id)
            .bind(&payload)
            .bind(job.attempts as i64)
            .bind(job.status.as_str())
            .bind(&job.last_error)
            .bind(&job.checkpoint_id)
            .bind(job.queued_at.to_rfc3339())
            .bind(job.updated_at.to_rfc3339())
            .execute(&*self.pool)
            .await
            .map_err(|e| CoordError::backend(format!("upsert {table}: {e}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: &CheckpointJob) -> Result<()> {
        self.upsert("checkpoint_jobs", job).await
    }

    async fn update(&self, job: &CheckpointJob) -> Result<()> {
        self.upsert("checkpoint_jobs", job).await
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoint_jobs WHERE id = ?1")
            .bind(job_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| CoordError::backend(format!("delete job: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn load_incomplete(&self) -> Result<Vec<CheckpointJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload, attempts, status, last_error, checkpoint_id, queued_at, updated_at
            FROM checkpoint_jobs
            WHERE status NOT IN ('completed', 'manual-intervention')
            ORDER BY queued_at ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| CoordError::backend(format!("load incomplete: {e}")))?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn insert_dead_letter(&self, job: &CheckpointJob) -> Result<()> {
        self.upsert("checkpoint_job_dead_letters", job).await?;
        self.delete(&job.id).await
    }

    async fn dead_letters(&self) -> Result<Vec<CheckpointJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload, attempts, status, last_error, checkpoint_id, queued_at, updated_at
            FROM checkpoint_job_dead_letters
            ORDER BY queued_at ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| CoordError::backend(format!("dead letters: {e}")))?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn remove_dead_letter(&self, job_id: &str) -> Result<Option<CheckpointJob>> {
        let row = sqlx::query(
            r#"
            SELECT id, payload, attempts, status, last_error, checkpoint_id, queued_at, updated_at
            FROM checkpoint_job_dead_letters
            WHERE id = ?1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| CoordError::backend(format!("select dead letter: {e}")))?;
        let job = match row {
            Some(row) => Self::row_to_job(&row)?,
            None => return Ok(None),
        };
        sqlx::query("DELETE FROM checkpoint_job_dead_letters WHERE id = ?1")
            .bind(job_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| CoordError::backend(format!("delete dead letter: {e}")))?;
        Ok(Some(job))
    }

    async fn save_recovery(&self, data: &RecoveryData) -> Result<()> {
        let encoded = serialize_json(data, "recovery data")?;
        sqlx::query(
            r#"
            INSERT INTO recovery_data (id, data, recorded_at)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(&encoded)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(|e| CoordError::backend(format!("save recovery: {e}")))?;
        Ok(())
    }

    async fn load_recovery(&self) -> Result<Option<RecoveryData>> {
        let row = sqlx::query("SELECT data FROM recovery_data WHERE id = 1")
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| CoordError::backend(format!("load recovery: {e}")))?;
        match row {
            Some(row) => {
                let raw: String = row.get("data");
                Ok(Some(deserialize_json(&raw, "recovery data")?))
            }
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| CoordError::backend(format!("ping: {e}")))?;
        Ok(())
    }
}

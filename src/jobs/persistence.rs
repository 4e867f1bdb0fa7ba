//! Durable mirror of the checkpoint job queue.
//!
//! The queue runs from memory; every state transition is mirrored through a
//! [`JobStore`] so a restart can hydrate the non-terminal jobs. This module
//! holds the store seam, the serde persistence models shared by the SQL
//! backends, and the in-memory reference store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::types::{CheckpointJob, CheckpointRequest, JobStatus};
use crate::errors::{CoordError, Result};
use crate::utils::json_ext::{deserialize_json, serialize_json};

/// Serialized row shape shared by the SQL stores.
///
/// Kept decoupled from the in-memory [`CheckpointJob`] so schema evolution is
/// localized here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedJob {
    pub id: String,
    pub payload: CheckpointRequest,
    pub attempts: u32,
    /// Kebab-case status text as stored in the `status` column.
    pub status: String,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    /// RFC3339 timestamps; keeps chrono types out of the serialized shape.
    pub queued_at: String,
    pub updated_at: String,
}

impl From<&CheckpointJob> for PersistedJob {
    fn from(job: &CheckpointJob) -> Self {
        Self {
            id: job.id.clone(),
            payload: job.payload.clone(),
            attempts: job.attempts,
            status: job.status.as_str().to_string(),
            last_error: job.last_error.clone(),
            checkpoint_id: job.checkpoint_id.clone(),
            queued_at: job.queued_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
        }
    }
}

impl TryFrom<PersistedJob> for CheckpointJob {
    type Error = CoordError;

    fn try_from(p: PersistedJob) -> Result<Self> {
        let status = JobStatus::parse(&p.status).ok_or_else(|| CoordError::Validation {
            message: format!("unknown job status: {}", p.status),
        })?;
        let parse_ts = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now())
        };
        Ok(CheckpointJob {
            id: p.id,
            payload: p.payload,
            attempts: p.attempts,
            status,
            last_error: p.last_error,
            checkpoint_id: p.checkpoint_id,
            queued_at: parse_ts(&p.queued_at),
            updated_at: parse_ts(&p.updated_at),
        })
    }
}

/// Serialize a job payload for a jsonb/text column.
pub fn payload_to_json(payload: &CheckpointRequest) -> Result<String> {
    serialize_json(payload, "job payload")
}

/// Deserialize a job payload from a jsonb/text column.
pub fn payload_from_json(raw: &str) -> Result<CheckpointRequest> {
    deserialize_json(raw, "job payload")
}

/// Data persisted at shutdown so the next run can resume coordination.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryData {
    pub active_session_ids: Vec<String>,
    pub unfinished_job_ids: Vec<String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Persistence seam for checkpoint jobs and the dead-letter set.
///
/// `insert` failures are fatal to the enqueue that triggered them; failures on
/// later transitions are logged by the queue and do not abort the in-memory
/// flow.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &CheckpointJob) -> Result<()>;

    async fn update(&self, job: &CheckpointJob) -> Result<()>;

    /// Remove the persisted record of a completed job.
    async fn delete(&self, job_id: &str) -> Result<()>;

    /// All non-terminal jobs ordered by `queued_at`, for hydration.
    async fn load_incomplete(&self) -> Result<Vec<CheckpointJob>>;

    async fn insert_dead_letter(&self, job: &CheckpointJob) -> Result<()>;

    async fn dead_letters(&self) -> Result<Vec<CheckpointJob>>;

    /// Remove a dead letter (operator requeue); returns it when present.
    async fn remove_dead_letter(&self, job_id: &str) -> Result<Option<CheckpointJob>>;

    async fn save_recovery(&self, data: &RecoveryData) -> Result<()>;

    async fn load_recovery(&self) -> Result<Option<RecoveryData>>;

    /// Liveness probe of the backing store.
    async fn ping(&self) -> Result<()>;
}

/// Volatile job store; the default when no SQL backend is configured.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<FxHashMap<String, CheckpointJob>>,
    dead: Mutex<FxHashMap<String, CheckpointJob>>,
    recovery: Mutex<Option<RecoveryData>>,
}

impl InMemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted (non-dead-letter) job rows; test aid.
    pub fn row_count(&self) -> usize {
        self.jobs.lock().len()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &CheckpointJob) -> Result<()> {
        self.jobs.lock().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update(&self, job: &CheckpointJob) -> Result<()> {
        self.jobs.lock().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        self.jobs.lock().remove(job_id);
        Ok(())
    }

    async fn load_incomplete(&self) -> Result<Vec<CheckpointJob>> {
        let mut jobs: Vec<CheckpointJob> = self
            .jobs
            .lock()
            .values()
            .filter(|job| !job.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        Ok(jobs)
    }

    async fn insert_dead_letter(&self, job: &CheckpointJob) -> Result<()> {
        self.dead.lock().insert(job.id.clone(), job.clone());
        self.jobs.lock().remove(&job.id);
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<CheckpointJob>> {
        let mut jobs: Vec<CheckpointJob> = self.dead.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        Ok(jobs)
    }

    async fn remove_dead_letter(&self, job_id: &str) -> Result<Option<CheckpointJob>> {
        Ok(self.dead.lock().remove(job_id))
    }

    async fn save_recovery(&self, data: &RecoveryData) -> Result<()> {
        *self.recovery.lock() = Some(data.clone());
        Ok(())
    }

    async fn load_recovery(&self) -> Result<Option<RecoveryData>> {
        Ok(self.recovery.lock().clone())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::CheckpointTrigger;

    fn job(id: &str) -> CheckpointJob {
        CheckpointJob::new(
            id.to_string(),
            CheckpointRequest::new("s1", vec!["f1".into()], "auto", 2, CheckpointTrigger::Manual),
        )
    }

    #[test]
    fn persisted_job_roundtrip() {
        let mut original = job("j1");
        original.attempts = 2;
        original.status = JobStatus::PendingRetry;
        original.last_error = Some("boom".into());
        let persisted = PersistedJob::from(&original);
        let restored = CheckpointJob::try_from(persisted).unwrap();
        assert_eq!(restored.id, original.id);
        assert_eq!(restored.attempts, 2);
        assert_eq!(restored.status, JobStatus::PendingRetry);
        assert_eq!(restored.payload, original.payload);
    }

    #[tokio::test]
    async fn incomplete_excludes_terminal_jobs() {
        let store = InMemoryJobStore::new();
        let mut a = job("a");
        a.queued_at = Utc::now() - chrono::Duration::seconds(10);
        let mut b = job("b");
        b.status = JobStatus::Completed;
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();
        let incomplete = store.load_incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, "a");
    }

    #[tokio::test]
    async fn dead_letters_move_out_of_job_rows() {
        let store = InMemoryJobStore::new();
        let j = job("j1");
        store.insert(&j).await.unwrap();
        store.insert_dead_letter(&j).await.unwrap();
        assert_eq!(store.row_count(), 0);
        assert_eq!(store.dead_letters().await.unwrap().len(), 1);
        let removed = store.remove_dead_letter("j1").await.unwrap();
        assert!(removed.is_some());
        assert!(store.dead_letters().await.unwrap().is_empty());
    }
}

//! Checkpoint job records and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{AgentId, EntityId};

/// What caused a checkpoint to be requested.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointTrigger {
    /// The events-since-checkpoint counter reached the configured interval.
    Interval,
    /// A `broke`/`fixed` event forced an immediate checkpoint.
    StateEvent,
    /// Explicit facade call.
    Manual,
    SessionClose,
    Shutdown,
}

/// Payload of a checkpoint job.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRequest {
    pub session_id: String,
    /// Deduplicated seed entities, kept sorted for stable serialization.
    pub seed_entity_ids: Vec<EntityId>,
    pub reason: String,
    pub hop_count: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Number of trailing events the seeds were derived from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<AgentId>,
    pub triggered_by: CheckpointTrigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

impl CheckpointRequest {
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        mut seed_entity_ids: Vec<EntityId>,
        reason: impl Into<String>,
        hop_count: u8,
        triggered_by: CheckpointTrigger,
    ) -> Self {
        seed_entity_ids.sort();
        seed_entity_ids.dedup();
        Self {
            session_id: session_id.into(),
            seed_entity_ids,
            reason: reason.into(),
            hop_count,
            sequence_number: None,
            event_id: None,
            window: None,
            actor: None,
            triggered_by,
            annotations: None,
        }
    }
}

/// Job lifecycle states.
///
/// Transitions are monotonic:
/// `queued → running → (completed | pending-retry → queued | manual-intervention)`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Running,
    PendingRetry,
    Completed,
    ManualIntervention,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::PendingRetry => "pending-retry",
            JobStatus::Completed => "completed",
            JobStatus::ManualIntervention => "manual-intervention",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "pending-retry" => Some(JobStatus::PendingRetry),
            "completed" => Some(JobStatus::Completed),
            "manual-intervention" => Some(JobStatus::ManualIntervention),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::ManualIntervention)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable checkpoint work item.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckpointJob {
    pub id: String,
    pub payload: CheckpointRequest,
    /// Runs started for this job; bounded by the configured attempt ceiling.
    pub attempts: u32,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Checkpoint created by an earlier attempt; later attempts reuse it
    /// instead of creating another, so at most one orphan ever exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointJob {
    #[must_use]
    pub fn new(id: String, payload: CheckpointRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            payload,
            attempts: 0,
            status: JobStatus::Queued,
            last_error: None,
            checkpoint_id: None,
            queued_at: now,
            updated_at: now,
        }
    }
}

/// Terminal result a waiting caller observes.
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Completed { checkpoint_id: String },
    DeadLettered { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_kebab_case() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::PendingRetry,
            JobStatus::Completed,
            JobStatus::ManualIntervention,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!(JobStatus::parse("unknown").is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::ManualIntervention.is_terminal());
        assert!(!JobStatus::PendingRetry.is_terminal());
    }

    #[test]
    fn request_deduplicates_seeds() {
        let req = CheckpointRequest::new(
            "s1",
            vec!["b".into(), "a".into(), "b".into()],
            "auto",
            2,
            CheckpointTrigger::Interval,
        );
        assert_eq!(req.seed_entity_ids, vec!["a".to_string(), "b".to_string()]);
    }
}

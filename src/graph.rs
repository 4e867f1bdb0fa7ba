//! Seam to the knowledge-graph collaborator.
//!
//! The coordination core never builds checkpoints itself; it asks this
//! collaborator to materialise them, annotate session relationships with the
//! outcome, and link checkpoints back to sessions. The in-memory
//! implementation records anchors for hosts without a graph backend and for
//! tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::EntityId;

/// Errors reported by the graph collaborator.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph backend unavailable: {0}")]
    Unavailable(String),
    #[error("graph rejected the request: {0}")]
    Rejected(String),
}

/// Terminal outcome recorded on anchors and links.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum AnchorOutcome {
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "manual-intervention")]
    ManualIntervention,
}

/// Annotation written onto session relationships for the seed entities.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointAnnotation {
    pub status: AnchorOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    /// Idempotency key: re-annotating with the same job id is a no-op on the
    /// collaborator side.
    pub job_id: String,
    pub attempts: u32,
}

/// Properties of the session → checkpoint link.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointLinkProps {
    pub status: AnchorOutcome,
    pub job_id: String,
    pub attempts: u32,
    pub reason: String,
}

/// Durable summary anchored to a session and its seed entities. Conceptually
/// owned by the graph collaborator; the core only reads these back in tests
/// and diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointAnchor {
    pub checkpoint_id: String,
    pub session_id: String,
    pub seed_entity_ids: Vec<EntityId>,
    pub reason: String,
    pub hop_count: u8,
    pub outcome: AnchorOutcome,
    pub created_at: DateTime<Utc>,
}

/// Operations the graph collaborator exposes to the core.
///
/// `annotate_session_relationships` and `create_session_checkpoint_link` must
/// be idempotent keyed by the job id carried in their arguments; the worker
/// retries them after transient failures.
#[async_trait]
pub trait GraphCollaborator: Send + Sync {
    /// Materialise a checkpoint around the seed entities. An empty returned
    /// id is treated as a failure by the caller.
    async fn create_checkpoint(
        &self,
        seed_entity_ids: &[EntityId],
        reason: &str,
        hop_count: u8,
        window: Option<u32>,
    ) -> Result<String, GraphError>;

    async fn annotate_session_relationships(
        &self,
        session_id: &str,
        seed_entity_ids: &[EntityId],
        annotation: &CheckpointAnnotation,
    ) -> Result<(), GraphError>;

    async fn create_session_checkpoint_link(
        &self,
        session_id: &str,
        checkpoint_id: &str,
        props: &CheckpointLinkProps,
    ) -> Result<(), GraphError>;

    /// Remove an orphaned checkpoint that was created but never linked.
    async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<(), GraphError>;
}

/// Optional in-process hook notified when a checkpoint is linked, so a
/// rollback subsystem can index restore points without querying the graph.
pub trait RollbackHook: Send + Sync {
    fn checkpoint_linked(&self, session_id: &str, checkpoint_id: &str);
}

/// In-memory rollback index; the default [`RollbackHook`].
#[derive(Default)]
pub struct InMemoryRollbackIndex {
    links: Mutex<FxHashMap<String, Vec<String>>>,
}

impl InMemoryRollbackIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkpoint ids linked for a session, oldest first.
    pub fn checkpoints_for(&self, session_id: &str) -> Vec<String> {
        self.links
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl RollbackHook for InMemoryRollbackIndex {
    fn checkpoint_linked(&self, session_id: &str, checkpoint_id: &str) {
        self.links
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(checkpoint_id.to_string());
    }
}

/// Process-local graph collaborator that records anchors and links.
///
/// Suitable for hosts running without a graph backend and as the reference
/// double in tests.
#[derive(Default)]
pub struct InMemoryGraphAnchors {
    state: Mutex<AnchorState>,
}

#[derive(Default)]
struct AnchorState {
    counter: u64,
    anchors: FxHashMap<String, CheckpointAnchor>,
    annotations: Vec<(String, CheckpointAnnotation)>,
    links: FxHashMap<String, CheckpointLinkProps>,
}

impl InMemoryGraphAnchors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn anchor(&self, checkpoint_id: &str) -> Option<CheckpointAnchor> {
        self.state.lock().anchors.get(checkpoint_id).cloned()
    }

    pub fn link(&self, checkpoint_id: &str) -> Option<CheckpointLinkProps> {
        self.state.lock().links.get(checkpoint_id).cloned()
    }

    pub fn annotations_for(&self, session_id: &str) -> Vec<CheckpointAnnotation> {
        self.state
            .lock()
            .annotations
            .iter()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, a)| a.clone())
            .collect()
    }
}

#[async_trait]
impl GraphCollaborator for InMemoryGraphAnchors {
    async fn create_checkpoint(
        &self,
        seed_entity_ids: &[EntityId],
        reason: &str,
        hop_count: u8,
        _window: Option<u32>,
    ) -> Result<String, GraphError> {
        if seed_entity_ids.is_empty() {
            return Err(GraphError::Rejected("empty seed set".to_string()));
        }
        let mut state = self.state.lock();
        state.counter += 1;
        let checkpoint_id = format!("cp-{}", state.counter);
        state.anchors.insert(
            checkpoint_id.clone(),
            CheckpointAnchor {
                checkpoint_id: checkpoint_id.clone(),
                session_id: String::new(),
                seed_entity_ids: seed_entity_ids.to_vec(),
                reason: reason.to_string(),
                hop_count,
                outcome: AnchorOutcome::Completed,
                created_at: Utc::now(),
            },
        );
        Ok(checkpoint_id)
    }

    async fn annotate_session_relationships(
        &self,
        session_id: &str,
        _seed_entity_ids: &[EntityId],
        annotation: &CheckpointAnnotation,
    ) -> Result<(), GraphError> {
        let mut state = self.state.lock();
        // Idempotent per (job, status): a retried annotation lands once.
        let duplicate = state.annotations.iter().any(|(sid, a)| {
            sid == session_id && a.job_id == annotation.job_id && a.status == annotation.status
        });
        if !duplicate {
            state
                .annotations
                .push((session_id.to_string(), annotation.clone()));
        }
        Ok(())
    }

    async fn create_session_checkpoint_link(
        &self,
        session_id: &str,
        checkpoint_id: &str,
        props: &CheckpointLinkProps,
    ) -> Result<(), GraphError> {
        let mut state = self.state.lock();
        if let Some(anchor) = state.anchors.get_mut(checkpoint_id) {
            anchor.session_id = session_id.to_string();
            anchor.outcome = props.status;
        }
        state.links.insert(checkpoint_id.to_string(), props.clone());
        Ok(())
    }

    async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<(), GraphError> {
        let mut state = self.state.lock();
        state.anchors.remove(checkpoint_id);
        state.links.remove(checkpoint_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkpoints_link_back_to_sessions() {
        let graph = InMemoryGraphAnchors::new();
        let cp = graph
            .create_checkpoint(&["f1".to_string()], "auto", 2, None)
            .await
            .unwrap();
        graph
            .create_session_checkpoint_link(
                "s1",
                &cp,
                &CheckpointLinkProps {
                    status: AnchorOutcome::Completed,
                    job_id: "j1".into(),
                    attempts: 1,
                    reason: "auto".into(),
                },
            )
            .await
            .unwrap();
        let anchor = graph.anchor(&cp).unwrap();
        assert_eq!(anchor.session_id, "s1");
        assert_eq!(anchor.outcome, AnchorOutcome::Completed);
    }

    #[tokio::test]
    async fn annotations_are_idempotent_by_job() {
        let graph = InMemoryGraphAnchors::new();
        let annotation = CheckpointAnnotation {
            status: AnchorOutcome::Completed,
            checkpoint_id: Some("cp-1".into()),
            job_id: "j1".into(),
            attempts: 2,
        };
        for _ in 0..3 {
            graph
                .annotate_session_relationships("s1", &["f1".to_string()], &annotation)
                .await
                .unwrap();
        }
        assert_eq!(graph.annotations_for("s1").len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_orphans() {
        let graph = InMemoryGraphAnchors::new();
        let cp = graph
            .create_checkpoint(&["f1".to_string()], "auto", 2, None)
            .await
            .unwrap();
        graph.delete_checkpoint(&cp).await.unwrap();
        assert!(graph.anchor(&cp).is_none());
    }
}

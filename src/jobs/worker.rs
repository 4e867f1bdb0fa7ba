//! Executes one checkpoint job against the graph collaborator.

use std::sync::Arc;

use tracing::instrument;

use super::types::CheckpointJob;
use crate::errors::{CoordError, Result};
use crate::graph::{
    AnchorOutcome, CheckpointAnnotation, CheckpointLinkProps, GraphCollaborator, RollbackHook,
};

/// Result of one attempt, with the checkpoint id the attempt created (or
/// reused) so the queue can carry it into the next attempt.
#[derive(Debug)]
pub struct AttemptOutcome {
    pub result: Result<String>,
    pub checkpoint_id: Option<String>,
}

/// Worker running single checkpoint jobs.
///
/// The happy path is create → annotate → (rollback hook) → link. An attempt
/// that fails after creating a checkpoint leaves it in place and records its
/// id on the job, so the next attempt reuses it instead of creating another;
/// only the final failed attempt deletes the orphan (or downgrades its link
/// if linking already happened). Retry and dead-letter scheduling stay with
/// the queue.
pub struct CheckpointWorker {
    graph: Arc<dyn GraphCollaborator>,
    rollback: Option<Arc<dyn RollbackHook>>,
}

impl CheckpointWorker {
    #[must_use]
    pub fn new(graph: Arc<dyn GraphCollaborator>) -> Self {
        Self {
            graph,
            rollback: None,
        }
    }

    #[must_use]
    pub fn with_rollback_hook(mut self, hook: Arc<dyn RollbackHook>) -> Self {
        self.rollback = Some(hook);
        self
    }

    /// Run one attempt. `final_attempt` controls whether failure cleanup may
    /// destroy the checkpoint.
    #[instrument(skip(self, job), fields(job_id = %job.id, session_id = %job.payload.session_id, attempt = job.attempts))]
    pub async fn execute(&self, job: &CheckpointJob, final_attempt: bool) -> AttemptOutcome {
        let mut created = job.checkpoint_id.clone();
        let mut linked = false;
        match self.run(job, &mut created, &mut linked).await {
            Ok(checkpoint_id) => AttemptOutcome {
                result: Ok(checkpoint_id.clone()),
                checkpoint_id: Some(checkpoint_id),
            },
            Err(err) => {
                tracing::warn!(
                    target: "sessionweave::jobs",
                    job_id = %job.id,
                    attempt = job.attempts,
                    final_attempt,
                    code = err.code(),
                    "checkpoint job attempt failed; cleaning up"
                );
                let survivor = self.cleanup(job, created, linked, final_attempt).await;
                AttemptOutcome {
                    result: Err(err),
                    checkpoint_id: survivor,
                }
            }
        }
    }

    async fn run(
        &self,
        job: &CheckpointJob,
        created: &mut Option<String>,
        linked: &mut bool,
    ) -> Result<String> {
        let request = &job.payload;

        let checkpoint_id = match created.clone() {
            Some(existing) => existing,
            None => {
                let checkpoint_id = self
                    .graph
                    .create_checkpoint(
                        &request.seed_entity_ids,
                        &request.reason,
                        request.hop_count,
                        request.window,
                    )
                    .await
                    .map_err(|e| CoordError::GraphCollaboratorFailure {
                        message: format!("create_checkpoint: {e}"),
                    })?;
                if checkpoint_id.is_empty() {
                    return Err(CoordError::GraphCollaboratorFailure {
                        message: "create_checkpoint returned an empty id".to_string(),
                    });
                }
                *created = Some(checkpoint_id.clone());
                checkpoint_id
            }
        };

        self.graph
            .annotate_session_relationships(
                &request.session_id,
                &request.seed_entity_ids,
                &CheckpointAnnotation {
                    status: AnchorOutcome::Completed,
                    checkpoint_id: Some(checkpoint_id.clone()),
                    job_id: job.id.clone(),
                    attempts: job.attempts,
                },
            )
            .await
            .map_err(|e| CoordError::GraphCollaboratorFailure {
                message: format!("annotate_session_relationships: {e}"),
            })?;

        if let Some(hook) = &self.rollback {
            hook.checkpoint_linked(&request.session_id, &checkpoint_id);
        }

        self.graph
            .create_session_checkpoint_link(
                &request.session_id,
                &checkpoint_id,
                &CheckpointLinkProps {
                    status: AnchorOutcome::Completed,
                    job_id: job.id.clone(),
                    attempts: job.attempts,
                    reason: request.reason.clone(),
                },
            )
            .await
            .map_err(|e| CoordError::GraphCollaboratorFailure {
                message: format!("create_session_checkpoint_link: {e}"),
            })?;
        *linked = true;

        Ok(checkpoint_id)
    }

    /// Best-effort failure cleanup. Returns the checkpoint id the job should
    /// keep for the next attempt (`None` once it was deleted).
    async fn cleanup(
        &self,
        job: &CheckpointJob,
        created: Option<String>,
        linked: bool,
        final_attempt: bool,
    ) -> Option<String> {
        let request = &job.payload;
        let _ = self
            .graph
            .annotate_session_relationships(
                &request.session_id,
                &request.seed_entity_ids,
                &CheckpointAnnotation {
                    status: AnchorOutcome::ManualIntervention,
                    checkpoint_id: created.clone(),
                    job_id: job.id.clone(),
                    attempts: job.attempts,
                },
            )
            .await;

        let checkpoint_id = created?;
        if !final_attempt {
            // Keep the checkpoint for the retry to reuse.
            return Some(checkpoint_id);
        }
        if linked {
            let _ = self
                .graph
                .create_session_checkpoint_link(
                    &request.session_id,
                    &checkpoint_id,
                    &CheckpointLinkProps {
                        status: AnchorOutcome::ManualIntervention,
                        job_id: job.id.clone(),
                        attempts: job.attempts,
                        reason: request.reason.clone(),
                    },
                )
                .await;
            Some(checkpoint_id)
        } else {
            if let Err(err) = self.graph.delete_checkpoint(&checkpoint_id).await {
                tracing::warn!(
                    target: "sessionweave::jobs",
                    job_id = %job.id,
                    checkpoint_id = %checkpoint_id,
                    error = %err,
                    "failed to delete orphan checkpoint"
                );
            }
            None
        }
    }
}

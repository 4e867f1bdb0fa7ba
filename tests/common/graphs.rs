//! Scriptable graph collaborator double.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use sessionweave::graph::{
    CheckpointAnnotation, CheckpointLinkProps, GraphCollaborator, GraphError,
};

#[derive(Clone, Debug, PartialEq)]
pub struct CreatedCheckpoint {
    pub checkpoint_id: String,
    pub seed_entity_ids: Vec<String>,
    pub reason: String,
    pub hop_count: u8,
}

/// Graph collaborator with programmable failures, delays, and a concurrency
/// gate, recording every call for assertions.
pub struct ScriptedGraph {
    counter: AtomicU32,
    pub create_calls: AtomicU32,
    pub annotate_calls: AtomicU32,
    pub link_calls: AtomicU32,
    pub delete_calls: AtomicU32,
    fail_create: AtomicU32,
    fail_annotate: AtomicBool,
    fail_link: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
    gate: Option<Arc<Semaphore>>,
    pub created: Mutex<Vec<CreatedCheckpoint>>,
    pub deleted: Mutex<Vec<String>>,
    pub annotations: Mutex<Vec<(String, CheckpointAnnotation)>>,
    pub links: Mutex<Vec<(String, String, CheckpointLinkProps)>>,
}

impl ScriptedGraph {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
            create_calls: AtomicU32::new(0),
            annotate_calls: AtomicU32::new(0),
            link_calls: AtomicU32::new(0),
            delete_calls: AtomicU32::new(0),
            fail_create: AtomicU32::new(0),
            fail_annotate: AtomicBool::new(false),
            fail_link: AtomicBool::new(false),
            create_delay: Mutex::new(None),
            gate: None,
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            annotations: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `n` `create_checkpoint` calls with a network error.
    pub fn failing_create(self, n: u32) -> Self {
        self.fail_create.store(n, Ordering::SeqCst);
        self
    }

    pub fn failing_annotate(self) -> Self {
        self.fail_annotate.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_link(self) -> Self {
        self.fail_link.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_fail_annotate(&self, fail: bool) {
        self.fail_annotate.store(fail, Ordering::SeqCst);
    }

    /// Delay each `create_checkpoint` call; for deadline tests.
    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.create_delay.lock() = Some(delay);
        self
    }

    /// Only `permits` calls may pass `create_checkpoint`; later calls park
    /// until [`release`](Self::release). Models a hung collaborator.
    pub fn with_gate(mut self, permits: usize) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(permits)));
        self
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn created_ids(&self) -> Vec<String> {
        self.created
            .lock()
            .iter()
            .map(|c| c.checkpoint_id.clone())
            .collect()
    }
}

#[async_trait]
impl GraphCollaborator for ScriptedGraph {
    async fn create_checkpoint(
        &self,
        seed_entity_ids: &[String],
        reason: &str,
        hop_count: u8,
        _window: Option<u32>,
    ) -> Result<String, GraphError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| GraphError::Unavailable("gate closed".to_string()))?;
            permit.forget();
        }
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_create
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GraphError::Unavailable(
                "simulated network error".to_string(),
            ));
        }
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let checkpoint_id = format!("cp{n}");
        self.created.lock().push(CreatedCheckpoint {
            checkpoint_id: checkpoint_id.clone(),
            seed_entity_ids: seed_entity_ids.to_vec(),
            reason: reason.to_string(),
            hop_count,
        });
        Ok(checkpoint_id)
    }

    async fn annotate_session_relationships(
        &self,
        session_id: &str,
        _seed_entity_ids: &[String],
        annotation: &CheckpointAnnotation,
    ) -> Result<(), GraphError> {
        self.annotate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_annotate.load(Ordering::SeqCst) {
            return Err(GraphError::Unavailable(
                "simulated annotate failure".to_string(),
            ));
        }
        self.annotations
            .lock()
            .push((session_id.to_string(), annotation.clone()));
        Ok(())
    }

    async fn create_session_checkpoint_link(
        &self,
        session_id: &str,
        checkpoint_id: &str,
        props: &CheckpointLinkProps,
    ) -> Result<(), GraphError> {
        self.link_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_link.load(Ordering::SeqCst) {
            return Err(GraphError::Unavailable(
                "simulated link failure".to_string(),
            ));
        }
        self.links.lock().push((
            session_id.to_string(),
            checkpoint_id.to_string(),
            props.clone(),
        ));
        Ok(())
    }

    async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<(), GraphError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.deleted.lock().push(checkpoint_id.to_string());
        Ok(())
    }
}

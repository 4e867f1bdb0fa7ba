mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{next_job_completed, ScriptedGraph};
use sessionweave::bus::{BusPayload, SessionBus};
use sessionweave::errors::{CoordError, Result};
use sessionweave::jobs::{
    CheckpointJob, CheckpointJobQueue, CheckpointRequest, CheckpointTrigger, CheckpointWorker,
    InMemoryJobStore, JobOutcome, JobStore, QueueConfig, RecoveryData,
};

fn fast_config(concurrency: usize) -> QueueConfig {
    QueueConfig {
        concurrency,
        max_attempts: 3,
        retry_delay: Duration::from_millis(10),
        ..QueueConfig::default()
    }
}

fn request(session: &str, entity: &str) -> CheckpointRequest {
    CheckpointRequest::new(
        session,
        vec![entity.to_string()],
        "auto",
        2,
        CheckpointTrigger::Manual,
    )
}

fn queue_with(
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    graph: Arc<ScriptedGraph>,
    bus: &SessionBus,
) -> CheckpointJobQueue {
    let queue = CheckpointJobQueue::new(config, store);
    queue.start(
        Arc::new(CheckpointWorker::new(graph)),
        bus.publisher(),
        "agent:coordination".to_string(),
    );
    queue
}

#[tokio::test]
async fn jobs_for_one_session_run_in_enqueue_order() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let graph = Arc::new(ScriptedGraph::new());
    let bus = SessionBus::bare();
    let mut coordination = bus.subscribe("agent:coordination");
    let queue = queue_with(fast_config(4), store, graph, &bus);

    let mut expected = Vec::new();
    for i in 0..5 {
        let ticket = queue
            .enqueue(request("same-session", &format!("e{i}")))
            .await
            .unwrap();
        expected.push(ticket.job_id);
    }
    assert!(queue.idle(Duration::from_secs(5)).await);

    let mut completed = Vec::new();
    while let Some(message) = coordination.next_timeout(Duration::from_millis(100)).await {
        if let BusPayload::JobCompleted { job_id, .. } = message.payload {
            completed.push(job_id);
        }
    }
    assert_eq!(completed, expected);
}

#[tokio::test]
async fn ticket_resolves_with_terminal_outcome() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let graph = Arc::new(ScriptedGraph::new());
    let bus = SessionBus::bare();
    let queue = queue_with(fast_config(1), store, graph, &bus);

    let ticket = queue.enqueue(request("s1", "f1")).await.unwrap();
    match ticket.wait().await {
        Some(JobOutcome::Completed { checkpoint_id }) => assert_eq!(checkpoint_id, "cp1"),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn crash_and_hydrate_requeues_unfinished_jobs_once() {
    // Five jobs; the collaborator hangs after two completions; the process
    // "crashes"; a fresh queue over the same store hydrates exactly the three
    // unfinished jobs, in order, and nothing runs twice.
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let graph = Arc::new(ScriptedGraph::new().with_gate(2));
    let bus = SessionBus::bare();
    let mut coordination = bus.subscribe("agent:coordination");

    let queue = queue_with(fast_config(1), Arc::clone(&store), graph.clone(), &bus);
    let mut job_ids = Vec::new();
    for i in 0..5 {
        let ticket = queue.enqueue(request("s1", &format!("e{i}"))).await.unwrap();
        job_ids.push(ticket.job_id);
        // Space the enqueues so queued_at ordering is unambiguous.
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let mut first_run_completed = Vec::new();
    for _ in 0..2 {
        let message = next_job_completed(&mut coordination, Duration::from_secs(5))
            .await
            .expect("two completions before the crash");
        if let BusPayload::JobCompleted { job_id, .. } = message.payload {
            first_run_completed.push(job_id);
        }
    }
    queue.abort();

    // Restart: new queue over the same persistence, collaborator unblocked.
    graph.release(100);
    let bus2 = SessionBus::bare();
    let mut coordination2 = bus2.subscribe("agent:coordination");
    let queue2 = CheckpointJobQueue::new(fast_config(1), Arc::clone(&store));
    let hydrated = queue2.hydrate_from_persistence().await.unwrap();
    assert_eq!(hydrated, 3);
    // Hydration is idempotent per job id.
    assert_eq!(queue2.hydrate_from_persistence().await.unwrap(), 0);
    queue2.start(
        Arc::new(CheckpointWorker::new(graph.clone())),
        bus2.publisher(),
        "agent:coordination".to_string(),
    );

    assert!(queue2.idle(Duration::from_secs(5)).await);
    let mut second_run_completed = Vec::new();
    while let Some(message) = coordination2.next_timeout(Duration::from_millis(100)).await {
        if let BusPayload::JobCompleted { job_id, .. } = message.payload {
            second_run_completed.push(job_id);
        }
    }

    assert_eq!(second_run_completed, job_ids[2..].to_vec());
    assert_eq!(first_run_completed, job_ids[..2].to_vec());
    // Five completions total across both runs; no job executed twice.
    assert_eq!(graph.create_calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn dead_letter_requeue_is_an_operator_command() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let graph = Arc::new(ScriptedGraph::new().failing_annotate());
    let bus = SessionBus::bare();
    let queue = queue_with(fast_config(1), Arc::clone(&store), graph.clone(), &bus);

    let ticket = queue.enqueue(request("s1", "f1")).await.unwrap();
    match ticket.wait().await {
        Some(JobOutcome::DeadLettered { .. }) => {}
        other => panic!("expected dead letter, got {other:?}"),
    }
    assert_eq!(queue.dead_letters().len(), 1);
    let job_id = queue.dead_letters()[0].id.clone();

    // Nothing re-queues automatically; the operator does it once the
    // collaborator recovers.
    graph.set_fail_annotate(false);
    let ticket = queue.requeue_dead_letter(&job_id).await.unwrap();
    match ticket.wait().await {
        Some(JobOutcome::Completed { .. }) => {}
        other => panic!("expected completion after requeue, got {other:?}"),
    }
    assert!(queue.dead_letters().is_empty());
}

/// Store whose inserts always fail; everything else delegates to memory.
struct InsertFailingStore {
    inner: InMemoryJobStore,
}

#[async_trait]
impl JobStore for InsertFailingStore {
    async fn insert(&self, _job: &CheckpointJob) -> Result<()> {
        Err(CoordError::backend("disk full"))
    }
    async fn update(&self, job: &CheckpointJob) -> Result<()> {
        self.inner.update(job).await
    }
    async fn delete(&self, job_id: &str) -> Result<()> {
        self.inner.delete(job_id).await
    }
    async fn load_incomplete(&self) -> Result<Vec<CheckpointJob>> {
        self.inner.load_incomplete().await
    }
    async fn insert_dead_letter(&self, job: &CheckpointJob) -> Result<()> {
        self.inner.insert_dead_letter(job).await
    }
    async fn dead_letters(&self) -> Result<Vec<CheckpointJob>> {
        self.inner.dead_letters().await
    }
    async fn remove_dead_letter(&self, job_id: &str) -> Result<Option<CheckpointJob>> {
        self.inner.remove_dead_letter(job_id).await
    }
    async fn save_recovery(&self, data: &RecoveryData) -> Result<()> {
        self.inner.save_recovery(data).await
    }
    async fn load_recovery(&self) -> Result<Option<RecoveryData>> {
        self.inner.load_recovery().await
    }
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn enqueue_is_fatal_when_persistence_rejects_it() {
    let store: Arc<dyn JobStore> = Arc::new(InsertFailingStore {
        inner: InMemoryJobStore::new(),
    });
    let graph = Arc::new(ScriptedGraph::new());
    let bus = SessionBus::bare();
    let queue = queue_with(fast_config(1), store, graph, &bus);

    let err = queue.enqueue(request("s1", "f1")).await.unwrap_err();
    assert_eq!(err.code(), "BACKEND_UNAVAILABLE");
    assert_eq!(queue.depth(), 0);
}

#[tokio::test]
async fn draining_queue_rejects_new_work() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let graph = Arc::new(ScriptedGraph::new());
    let bus = SessionBus::bare();
    let queue = queue_with(fast_config(1), store, graph, &bus);

    queue.enqueue(request("s1", "f1")).await.unwrap();
    queue.drain().await;
    let err = queue.enqueue(request("s1", "f2")).await.unwrap_err();
    assert_eq!(err.code(), "SHUTTING_DOWN");
}

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{manager_with, modified, next_job_completed, test_config, ScriptedGraph};
use sessionweave::bus::BusPayload;
use sessionweave::event::{ChangeInfo, ChangeOperation, EventDraft, EventType};
use sessionweave::graph::AnchorOutcome;
use sessionweave::jobs::JobStatus;
use sessionweave::manager::CheckpointOptions;

#[tokio::test]
async fn auto_checkpoint_happy_path() {
    // Two events at interval 2 trigger an automatic checkpoint that runs to
    // completion through the collaborator.
    let graph = Arc::new(ScriptedGraph::new());
    let config = test_config()
        .with_checkpoint_interval(2)
        .with_max_attempts(3);
    let (manager, bus) = manager_with(config, graph.clone()).await;
    let mut coordination = bus.subscribe("agent:coordination");

    let session_id = manager.create_session("agent-A", None).await.unwrap();
    manager
        .emit_event(&session_id, modified("f1"), "agent-A")
        .await
        .unwrap();
    manager
        .emit_event(&session_id, modified("f1"), "agent-A")
        .await
        .unwrap();

    let message = next_job_completed(&mut coordination, Duration::from_secs(5))
        .await
        .expect("jobCompleted notice");
    let (job_id, checkpoint_id) = match message.payload {
        BusPayload::JobCompleted {
            job_id,
            checkpoint_id,
            ..
        } => (job_id, checkpoint_id),
        other => panic!("expected jobCompleted, got {other:?}"),
    };
    assert_eq!(checkpoint_id, "cp1");

    let created = graph.created.lock().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].seed_entity_ids, vec!["f1".to_string()]);
    assert_eq!(created[0].reason, "auto");
    assert_eq!(created[0].hop_count, 2);

    let job = manager.queue().get_job(&job_id).expect("job record");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);

    let link = graph.links.lock().clone();
    assert_eq!(link.len(), 1);
    assert_eq!(link[0].2.status, AnchorOutcome::Completed);
}

#[tokio::test]
async fn emit_by_stranger_is_rejected() {
    let graph = Arc::new(ScriptedGraph::new());
    let (manager, _bus) = manager_with(test_config(), graph).await;

    let session_id = manager.create_session("agent-A", None).await.unwrap();
    manager
        .emit_event(&session_id, modified("f1"), "agent-A")
        .await
        .unwrap();
    manager
        .emit_event(&session_id, modified("f1"), "agent-A")
        .await
        .unwrap();

    let err = manager
        .emit_event(&session_id, modified("f1"), "agent-B")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ACTOR_NOT_JOINED");

    // The rejected event was never appended.
    let stats = manager.get_stats().await.unwrap();
    assert_eq!(stats.events, 2);
    let events = manager.events(&session_id, 1, None).await.unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.actor == "agent-A"));
}

#[tokio::test]
async fn retry_then_success() {
    // First create_checkpoint fails with a network error, the retry succeeds.
    let graph = Arc::new(ScriptedGraph::new().failing_create(1));
    let config = test_config().with_max_attempts(3);
    let (manager, bus) = manager_with(config, graph.clone()).await;
    let mut coordination = bus.subscribe("agent:coordination");

    let session_id = manager.create_session("agent-A", None).await.unwrap();
    manager
        .emit_event(&session_id, modified("f1"), "agent-A")
        .await
        .unwrap();

    let checkpoint_id = manager
        .checkpoint(&session_id, CheckpointOptions::default())
        .await
        .unwrap();
    assert_eq!(checkpoint_id, "cp1");

    let mut attempt_failures = 0;
    let mut completions = 0;
    while let Some(message) = coordination.next_timeout(Duration::from_millis(200)).await {
        match message.payload {
            BusPayload::JobAttemptFailed { attempt, .. } => {
                attempt_failures += 1;
                assert_eq!(attempt, 1);
            }
            BusPayload::JobCompleted { job_id, .. } => {
                completions += 1;
                let job = manager.queue().get_job(&job_id).unwrap();
                assert_eq!(job.attempts, 2);
                assert_eq!(job.status, JobStatus::Completed);
            }
            _ => {}
        }
    }
    assert_eq!(attempt_failures, 1);
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn dead_letter_after_exhausted_retries() {
    // Annotation always fails: three attempts, then manual intervention. The
    // orphan checkpoint is deleted exactly once.
    let graph = Arc::new(ScriptedGraph::new().failing_annotate());
    let config = test_config().with_max_attempts(3);
    let (manager, bus) = manager_with(config, graph.clone()).await;
    let mut coordination = bus.subscribe("agent:coordination");

    let session_id = manager.create_session("agent-A", None).await.unwrap();
    manager
        .emit_event(&session_id, modified("f1"), "agent-A")
        .await
        .unwrap();

    let err = manager
        .checkpoint(&session_id, CheckpointOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "GRAPH_COLLABORATOR_FAILURE");

    let dead = manager.queue().dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].status, JobStatus::ManualIntervention);

    assert_eq!(graph.delete_calls.load(Ordering::SeqCst), 1);
    assert_eq!(graph.deleted.lock().clone(), vec!["cp1".to_string()]);
    // The checkpoint was created once and reused across attempts.
    assert_eq!(graph.create_calls.load(Ordering::SeqCst), 1);

    let mut saw_dead_letter = false;
    while let Some(message) = coordination.next_timeout(Duration::from_millis(100)).await {
        if let BusPayload::JobDeadLettered { job_id, .. } = message.payload {
            assert_eq!(job_id, dead[0].id);
            saw_dead_letter = true;
        }
    }
    assert!(saw_dead_letter);
}

#[tokio::test]
async fn slow_checkpoint_reports_pending() {
    let graph = Arc::new(ScriptedGraph::new().with_create_delay(Duration::from_millis(300)));
    let (manager, bus) = manager_with(test_config(), graph).await;
    let mut coordination = bus.subscribe("agent:coordination");

    let session_id = manager.create_session("agent-A", None).await.unwrap();
    manager
        .emit_event(&session_id, modified("f1"), "agent-A")
        .await
        .unwrap();

    let err = manager
        .checkpoint(
            &session_id,
            CheckpointOptions {
                timeout: Some(Duration::from_millis(20)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CHECKPOINT_PENDING");

    // The job keeps running in the background and still completes.
    assert!(
        next_job_completed(&mut coordination, Duration::from_secs(5))
            .await
            .is_some()
    );
}

#[tokio::test]
async fn events_without_entities_skip_auto_checkpoint() {
    let graph = Arc::new(ScriptedGraph::new());
    let config = test_config().with_checkpoint_interval(2);
    let (manager, bus) = manager_with(config, graph.clone()).await;
    let mut coordination = bus.subscribe("agent:coordination");

    let session_id = manager.create_session("agent-A", None).await.unwrap();
    for _ in 0..4 {
        let draft = EventDraft::new(
            EventType::Modified,
            ChangeInfo::new("note", Vec::new(), ChangeOperation::Modified),
        );
        manager
            .emit_event(&session_id, draft, "agent-A")
            .await
            .unwrap();
    }

    assert!(
        coordination
            .next_timeout(Duration::from_millis(150))
            .await
            .is_none(),
        "no checkpoint job should run for an empty seed set"
    );
    assert_eq!(graph.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn explicit_checkpoint_with_no_seeds_is_invalid() {
    let graph = Arc::new(ScriptedGraph::new());
    let (manager, _bus) = manager_with(test_config(), graph).await;
    let session_id = manager.create_session("agent-A", None).await.unwrap();
    let err = manager
        .checkpoint(&session_id, CheckpointOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION");
}

#[tokio::test]
async fn broke_event_forces_checkpoint_before_interval() {
    let graph = Arc::new(ScriptedGraph::new());
    let config = test_config().with_checkpoint_interval(100);
    let (manager, bus) = manager_with(config, graph.clone()).await;
    let mut coordination = bus.subscribe("agent:coordination");

    let session_id = manager.create_session("agent-A", None).await.unwrap();
    let draft = EventDraft::new(
        EventType::Broke,
        ChangeInfo::new("function", vec!["f9".into()], ChangeOperation::Failed),
    );
    manager
        .emit_event(&session_id, draft, "agent-A")
        .await
        .unwrap();

    assert!(
        next_job_completed(&mut coordination, Duration::from_secs(5))
            .await
            .is_some()
    );
    let created = graph.created.lock().clone();
    assert_eq!(created[0].seed_entity_ids, vec!["f9".to_string()]);
}

#[tokio::test]
async fn join_records_handoff_event() {
    let graph = Arc::new(ScriptedGraph::new());
    let (manager, _bus) = manager_with(test_config(), graph).await;

    let session_id = manager.create_session("agent-A", None).await.unwrap();
    manager.join_session(&session_id, "agent-B").await.unwrap();

    let events = manager.events(&session_id, 1, None).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Handoff);
    assert_eq!(events[0].actor, "agent-B");

    // The joined agent can emit now.
    manager
        .emit_event(&session_id, modified("f1"), "agent-B")
        .await
        .unwrap();
}

#[tokio::test]
async fn paused_sessions_reject_emits() {
    let graph = Arc::new(ScriptedGraph::new());
    let (manager, _bus) = manager_with(test_config(), graph).await;

    let session_id = manager.create_session("agent-A", None).await.unwrap();
    manager.pause_session(&session_id).await.unwrap();
    let err = manager
        .emit_event(&session_id, modified("f1"), "agent-A")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION");

    manager.resume_session(&session_id).await.unwrap();
    manager
        .emit_event(&session_id, modified("f1"), "agent-A")
        .await
        .unwrap();
}

#[tokio::test]
async fn close_session_emits_terminal_event_and_final_checkpoint() {
    let graph = Arc::new(ScriptedGraph::new());
    let config = test_config().with_checkpoint_interval(50);
    let (manager, bus) = manager_with(config, graph.clone()).await;
    let mut global = bus.subscribe("global:sessions");
    let mut coordination = bus.subscribe("agent:coordination");

    let session_id = manager.create_session("agent-A", None).await.unwrap();
    manager
        .emit_event(&session_id, modified("f1"), "agent-A")
        .await
        .unwrap();

    let doc = manager.close_session(&session_id, "done").await.unwrap();
    assert_eq!(doc.closed_reason.as_deref(), Some("done"));

    // Terminal checkpoint-typed event is the last appended event.
    let events = manager.events(&session_id, 1, None).await.unwrap();
    assert_eq!(
        events.last().unwrap().event_type,
        EventType::Checkpoint
    );

    // Close notice on the global channel.
    let mut saw_close = false;
    while let Some(message) = global.next_timeout(Duration::from_millis(200)).await {
        if matches!(message.payload, BusPayload::SessionClosed { .. }) {
            saw_close = true;
            break;
        }
    }
    assert!(saw_close);

    // Final checkpoint with reason "close".
    assert!(
        next_job_completed(&mut coordination, Duration::from_secs(5))
            .await
            .is_some()
    );
    let created = graph.created.lock().clone();
    assert!(created.iter().any(|c| c.reason == "close"));

    // No further emits after close.
    let err = manager
        .emit_event(&session_id, modified("f1"), "agent-A")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION");
}

#[tokio::test]
async fn emit_deadline_is_honoured() {
    let graph = Arc::new(ScriptedGraph::new());
    let (manager, _bus) = manager_with(test_config(), graph).await;
    let session_id = manager.create_session("agent-A", None).await.unwrap();

    // A generous deadline succeeds.
    let seq = manager
        .emit_event_with_deadline(
            &session_id,
            modified("f1"),
            "agent-A",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(seq, 1);
}

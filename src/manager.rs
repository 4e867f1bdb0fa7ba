//! Public facade of the coordination core.
//!
//! `SessionManager` owns the wiring between the session store, the event log,
//! the bus, the checkpoint job queue, and the agent registry. Hosts construct
//! one through [`SessionManager::builder`], keep it in an `Arc`, and drive
//! everything through its methods.
//!
//! The facade never surfaces background failures for an event that was
//! already accepted: job errors travel over the bus as `jobAttemptFailed` /
//! `jobFailed` / `jobDeadLettered` notices. It throws for invariant
//! violations at entry and reports `CHECKPOINT_PENDING` when a synchronous
//! checkpoint outlives its caller's deadline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::agents::AgentRegistry;
use crate::bus::{BusPayload, SessionBus};
use crate::config::{clamp_hop_count, CoordinatorConfig};
use crate::errors::{CoordError, Result};
use crate::event::{ChangeInfo, ChangeOperation, EntityId, EventDraft, EventType, SessionEvent};
use crate::graph::{GraphCollaborator, InMemoryGraphAnchors, RollbackHook};
use crate::health::{ComponentStatus, HealthReport, ShutdownPhase, ShutdownReport};
use crate::jobs::{
    CheckpointJobQueue, CheckpointRequest, CheckpointTrigger, CheckpointWorker, InMemoryJobStore,
    JobOutcome, JobStore, QueueConfig, QueueStats, RecoveryData,
};
use crate::log::{EventLog, InMemoryEventLog};
use crate::sessions::{InMemorySessionStore, SessionDocument, SessionOptions, SessionState, SessionStore};
use crate::utils::ids::IdGenerator;

/// Default grace period for [`SessionManager::shutdown`].
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Options for a synchronous checkpoint request.
#[derive(Clone, Debug, Default)]
pub struct CheckpointOptions {
    /// Explicit seeds; derived from the recent event window when absent.
    pub seed_entity_ids: Option<Vec<EntityId>>,
    pub reason: Option<String>,
    /// Traversal depth, clamped to 1..=5 (default 2).
    pub hop_count: Option<u8>,
    /// Event window for seed derivation; defaults to the checkpoint interval.
    pub window: Option<u32>,
    /// Caller deadline; expiry yields `CHECKPOINT_PENDING` while the job
    /// keeps running in the background.
    pub timeout: Option<Duration>,
}

/// Aggregate counters for `get_stats`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub active_sessions: usize,
    /// Events accepted since this manager started.
    pub events: u64,
    pub queue: QueueStats,
}

/// Per-session counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStats {
    pub session_id: String,
    pub state: SessionState,
    pub agents: usize,
    /// Total events appended over the session's lifetime.
    pub events: u64,
    pub events_since_checkpoint: u32,
}

pub struct SessionManagerBuilder {
    config: CoordinatorConfig,
    store: Option<Arc<dyn SessionStore>>,
    log: Option<Arc<dyn EventLog>>,
    bus: Option<Arc<SessionBus>>,
    graph: Option<Arc<dyn GraphCollaborator>>,
    job_store: Option<Arc<dyn JobStore>>,
    rollback: Option<Arc<dyn RollbackHook>>,
    hydrate: bool,
}

impl SessionManagerBuilder {
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            store: None,
            log: None,
            bus: None,
            graph: None,
            job_store: None,
            rollback: None,
            hydrate: false,
        }
    }

    #[must_use]
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    #[must_use]
    pub fn with_bus(mut self, bus: Arc<SessionBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    #[must_use]
    pub fn with_graph(mut self, graph: Arc<dyn GraphCollaborator>) -> Self {
        self.graph = Some(graph);
        self
    }

    #[must_use]
    pub fn with_job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_rollback_hook(mut self, hook: Arc<dyn RollbackHook>) -> Self {
        self.rollback = Some(hook);
        self
    }

    /// Re-queue persisted non-terminal jobs during build (restart path).
    #[must_use]
    pub fn hydrate_jobs(mut self) -> Self {
        self.hydrate = true;
        self
    }

    /// Validate the configuration and wire everything together.
    pub async fn build(self) -> Result<SessionManager> {
        self.config.validate_config()?;
        let config = self.config;
        let channels = config.pub_sub_channels.clone();

        let sessions: Arc<dyn SessionStore> = self.store.unwrap_or_else(|| {
            Arc::new(InMemorySessionStore::new(
                config.default_ttl_seconds,
                config.grace_ttl_seconds,
            ))
        });
        let log: Arc<dyn EventLog> = self
            .log
            .unwrap_or_else(|| Arc::new(InMemoryEventLog::new(config.max_events_per_session as usize)));
        let bus = self.bus.unwrap_or_else(|| Arc::new(SessionBus::bare()));
        let graph: Arc<dyn GraphCollaborator> = self
            .graph
            .unwrap_or_else(|| Arc::new(InMemoryGraphAnchors::new()));
        let job_store: Arc<dyn JobStore> =
            self.job_store.unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));

        let queue = Arc::new(CheckpointJobQueue::new(
            QueueConfig::from_coordinator(&config),
            Arc::clone(&job_store),
        ));
        if self.hydrate {
            queue.hydrate_from_persistence().await?;
        }
        let mut worker = CheckpointWorker::new(Arc::clone(&graph));
        if let Some(hook) = self.rollback {
            worker = worker.with_rollback_hook(hook);
        }
        queue.start(
            Arc::new(worker),
            bus.publisher(),
            channels.agent_coordination.clone(),
        );

        let registry = Arc::new(AgentRegistry::new(
            bus.publisher(),
            channels.agent_events.clone(),
            channels.agent_heartbeat.clone(),
            config.heartbeat_timeout(),
        ));

        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Ok(SessionManager {
            config,
            sessions,
            log,
            bus,
            queue,
            registry,
            events_accepted: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            shutdown_phase: phase_tx,
            stale_scanner: Mutex::new(None),
            ids: IdGenerator::new(),
        })
    }
}

/// Facade coordinating sessions, streams, and checkpoint jobs.
pub struct SessionManager {
    config: CoordinatorConfig,
    sessions: Arc<dyn SessionStore>,
    log: Arc<dyn EventLog>,
    bus: Arc<SessionBus>,
    queue: Arc<CheckpointJobQueue>,
    registry: Arc<AgentRegistry>,
    events_accepted: AtomicU64,
    shutting_down: AtomicBool,
    shutdown_phase: watch::Sender<ShutdownPhase>,
    stale_scanner: Mutex<Option<JoinHandle<()>>>,
    ids: IdGenerator,
}

impl SessionManager {
    #[must_use]
    pub fn builder(config: CoordinatorConfig) -> SessionManagerBuilder {
        SessionManagerBuilder::new(config)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<SessionBus> {
        &self.bus
    }

    pub fn queue(&self) -> &Arc<CheckpointJobQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Watch the shutdown phase progression.
    pub fn shutdown_phase(&self) -> watch::Receiver<ShutdownPhase> {
        self.shutdown_phase.subscribe()
    }

    /// Create a session with `agent_id` as its first member.
    #[instrument(skip(self, opts), fields(request_id = %self.ids.request_id()), err)]
    pub async fn create_session(
        &self,
        agent_id: &str,
        opts: Option<SessionOptions>,
    ) -> Result<String> {
        self.guard_shutdown()?;
        let doc = self
            .sessions
            .create(agent_id, opts.unwrap_or_default())
            .await?;
        let _ = self.bus.publish(
            self.config.pub_sub_channels.global_sessions.clone(),
            BusPayload::SessionCreated {
                session_id: doc.id.clone(),
                agent_id: agent_id.to_string(),
            },
        );
        Ok(doc.id)
    }

    /// Add an agent to a session; records an implicit `handoff` event.
    #[instrument(skip(self), fields(request_id = %self.ids.request_id()), err)]
    pub async fn join_session(&self, session_id: &str, agent_id: &str) -> Result<()> {
        self.guard_shutdown()?;
        self.sessions.join(session_id, agent_id).await?;
        let draft = EventDraft::new(
            EventType::Handoff,
            ChangeInfo::new(
                "session",
                Vec::new(),
                ChangeOperation::Other("joined".to_string()),
            ),
        );
        // The join is already durable; a failed implicit event should not
        // undo membership.
        if let Err(err) = self.emit_inner(session_id, draft, agent_id).await {
            tracing::debug!(
                target: "sessionweave::manager",
                session_id,
                agent_id,
                code = err.code(),
                "implicit handoff event not recorded"
            );
        }
        let _ = self.bus.publish(
            self.config.pub_sub_channels.global_sessions.clone(),
            BusPayload::Handoff {
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
                joined: true,
            },
        );
        Ok(())
    }

    #[instrument(skip(self), fields(request_id = %self.ids.request_id()), err)]
    pub async fn leave_session(&self, session_id: &str, agent_id: &str) -> Result<()> {
        let outcome = self.sessions.leave(session_id, agent_id).await?;
        let _ = self.bus.publish(
            self.config.pub_sub_channels.global_sessions.clone(),
            BusPayload::Handoff {
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
                joined: false,
            },
        );
        if outcome.last_agent_left {
            tracing::info!(
                target: "sessionweave::manager",
                session_id,
                "last agent left; session closes after the grace window"
            );
        }
        Ok(())
    }

    /// Append one event to a session's stream and publish it.
    ///
    /// Validates membership and session liveness, assigns the next sequence
    /// number, appends durably, and only then publishes on `session:<id>`.
    /// May schedule an automatic checkpoint (fire-and-forget) afterwards.
    #[instrument(
        skip(self, draft),
        fields(request_id = %self.ids.request_id(), actor = %actor),
        err
    )]
    pub async fn emit_event(
        &self,
        session_id: &str,
        draft: EventDraft,
        actor: &str,
    ) -> Result<u64> {
        self.emit_inner(session_id, draft, actor).await
    }

    /// [`emit_event`](Self::emit_event) with a caller deadline.
    ///
    /// On expiry the call returns `TIMEOUT`; the append may still have
    /// committed (check `session_stats`).
    pub async fn emit_event_with_deadline(
        &self,
        session_id: &str,
        draft: EventDraft,
        actor: &str,
        deadline: Duration,
    ) -> Result<u64> {
        let started = Instant::now();
        match tokio::time::timeout(deadline, self.emit_inner(session_id, draft, actor)).await {
            Ok(result) => result,
            Err(_) => Err(CoordError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    async fn emit_inner(&self, session_id: &str, draft: EventDraft, actor: &str) -> Result<u64> {
        self.guard_shutdown()?;
        let now = Utc::now();
        let ticket = self.sessions.reserve_seq(session_id, actor, now).await?;
        let event = SessionEvent::from_draft(draft, ticket.seq, actor);
        let forces_checkpoint = event.event_type.forces_checkpoint();
        self.log.append(session_id, event.clone()).await?;
        self.events_accepted.fetch_add(1, Ordering::Relaxed);

        // Publish-after-commit: anything a subscriber sees is already stored.
        if let Err(err) = self.bus.publish(
            self.config.pub_sub_channels.session(session_id),
            BusPayload::SessionEvent {
                session_id: session_id.to_string(),
                event,
            },
        ) {
            tracing::debug!(
                target: "sessionweave::manager",
                session_id,
                error = %err,
                "session event publish skipped"
            );
        }

        if forces_checkpoint
            || ticket.events_since_checkpoint >= self.config.checkpoint_interval
        {
            let trigger = if forces_checkpoint {
                CheckpointTrigger::StateEvent
            } else {
                CheckpointTrigger::Interval
            };
            self.spawn_auto_checkpoint(session_id, actor, ticket.seq, trigger);
        }
        Ok(ticket.seq)
    }

    /// Fire-and-forget enqueue of an automatic checkpoint; the emit that
    /// triggered it has already returned by the time this runs.
    fn spawn_auto_checkpoint(
        &self,
        session_id: &str,
        actor: &str,
        seq: u64,
        trigger: CheckpointTrigger,
    ) {
        let sessions = Arc::clone(&self.sessions);
        let log = Arc::clone(&self.log);
        let queue = Arc::clone(&self.queue);
        let hop_count = clamp_hop_count(None);
        let window = self.config.checkpoint_interval;
        let session_id = session_id.to_string();
        let actor = actor.to_string();
        tokio::spawn(async move {
            let seeds = match derive_seed_union(&*log, &session_id, window as usize).await {
                Ok(seeds) => seeds,
                Err(err) => {
                    tracing::warn!(
                        target: "sessionweave::manager",
                        session_id = %session_id,
                        code = err.code(),
                        "auto-checkpoint seed derivation failed"
                    );
                    return;
                }
            };
            if seeds.is_empty() {
                tracing::info!(
                    target: "sessionweave::manager",
                    session_id = %session_id,
                    "auto-checkpoint skipped: empty seed set"
                );
                return;
            }
            let _ = sessions.reset_checkpoint_counter(&session_id).await;
            let mut request = CheckpointRequest::new(
                session_id.clone(),
                seeds,
                "auto",
                hop_count,
                trigger,
            );
            request.window = Some(window);
            request.actor = Some(actor);
            request.sequence_number = Some(seq);
            if let Err(err) = queue.enqueue(request).await {
                tracing::warn!(
                    target: "sessionweave::manager",
                    session_id = %session_id,
                    code = err.code(),
                    "auto-checkpoint enqueue failed"
                );
            }
        });
    }

    /// Enqueue a checkpoint job and wait for its terminal state.
    ///
    /// Seeds default to the union of `change_info.entity_ids` over the recent
    /// window; an empty set is a `VALIDATION` error for this explicit path.
    #[instrument(skip(self, opts), fields(request_id = %self.ids.request_id()), err)]
    pub async fn checkpoint(&self, session_id: &str, opts: CheckpointOptions) -> Result<String> {
        self.guard_shutdown()?;
        self.sessions.get(session_id).await?;
        let window = opts.window.unwrap_or(self.config.checkpoint_interval);
        let seeds = match opts.seed_entity_ids {
            Some(seeds) if !seeds.is_empty() => seeds,
            _ => derive_seed_union(&*self.log, session_id, window as usize).await?,
        };
        if seeds.is_empty() {
            return Err(CoordError::validation(
                "checkpoint requires a non-empty seed set",
            ));
        }
        let mut request = CheckpointRequest::new(
            session_id,
            seeds,
            opts.reason.unwrap_or_else(|| "manual".to_string()),
            clamp_hop_count(opts.hop_count),
            CheckpointTrigger::Manual,
        );
        request.window = Some(window);
        let ticket = self.queue.enqueue(request).await?;
        let job_id = ticket.job_id.clone();
        let _ = self.sessions.reset_checkpoint_counter(session_id).await;

        let outcome = match opts.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, ticket.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(CoordError::CheckpointPending { job_id }),
            },
            None => ticket.wait().await,
        };
        match outcome {
            Some(JobOutcome::Completed { checkpoint_id }) => Ok(checkpoint_id),
            Some(JobOutcome::DeadLettered { error }) => {
                Err(CoordError::GraphCollaboratorFailure { message: error })
            }
            None => Err(CoordError::backend("queue stopped before the job finished")),
        }
    }

    /// Close a session: a terminal `checkpoint`-typed event is appended, the
    /// store record flips to `closed`, a close notice goes out, and a final
    /// checkpoint job is enqueued when the recent window has seeds.
    #[instrument(skip(self), fields(request_id = %self.ids.request_id()), err)]
    pub async fn close_session(&self, session_id: &str, reason: &str) -> Result<SessionDocument> {
        let session = self.sessions.get(session_id).await?;
        if session.state == SessionState::Active {
            if let Some(actor) = session.agent_ids.iter().next().cloned() {
                let draft = EventDraft::new(
                    EventType::Checkpoint,
                    ChangeInfo::new(
                        "session",
                        Vec::new(),
                        ChangeOperation::Other("closed".to_string()),
                    ),
                )
                .with_payload(json!({ "reason": reason }));
                if let Err(err) = self.emit_inner(session_id, draft, &actor).await {
                    tracing::debug!(
                        target: "sessionweave::manager",
                        session_id,
                        code = err.code(),
                        "terminal close event not recorded"
                    );
                }
            }
        }
        let window = self.config.checkpoint_interval;
        let seeds = derive_seed_union(&*self.log, session_id, window as usize)
            .await
            .unwrap_or_default();
        let doc = self.sessions.close(session_id, reason).await?;
        let _ = self.bus.publish(
            self.config.pub_sub_channels.global_sessions.clone(),
            BusPayload::SessionClosed {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            },
        );
        if seeds.is_empty() {
            tracing::info!(
                target: "sessionweave::manager",
                session_id,
                "close checkpoint skipped: empty seed set"
            );
        } else {
            let mut request = CheckpointRequest::new(
                session_id,
                seeds,
                "close",
                clamp_hop_count(None),
                CheckpointTrigger::SessionClose,
            );
            request.window = Some(window);
            if let Err(err) = self.queue.enqueue(request).await {
                tracing::warn!(
                    target: "sessionweave::manager",
                    session_id,
                    code = err.code(),
                    "close checkpoint enqueue failed"
                );
            }
        }
        Ok(doc)
    }

    /// Pause an active session; emits fail with `VALIDATION` until resumed.
    pub async fn pause_session(&self, session_id: &str) -> Result<()> {
        self.sessions.set_state(session_id, SessionState::Paused).await
    }

    pub async fn resume_session(&self, session_id: &str) -> Result<()> {
        self.guard_shutdown()?;
        self.sessions.set_state(session_id, SessionState::Active).await
    }

    /// Refresh a session's TTL without recording an event.
    pub async fn touch_session(&self, session_id: &str) -> Result<()> {
        self.sessions.touch(session_id, Utc::now()).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionDocument> {
        self.sessions.get(session_id).await
    }

    pub async fn list_active_sessions(&self) -> Result<Vec<SessionDocument>> {
        self.sessions.list_active().await
    }

    pub async fn sessions_by_agent(&self, agent_id: &str) -> Result<Vec<SessionDocument>> {
        self.sessions.by_agent(agent_id).await
    }

    /// Events of one session in sequence order.
    pub async fn events(
        &self,
        session_id: &str,
        from_seq: u64,
        to_seq: Option<u64>,
    ) -> Result<Vec<SessionEvent>> {
        self.log.range(session_id, from_seq, to_seq).await
    }

    pub async fn get_stats(&self) -> Result<CoordinatorStats> {
        let active = self.sessions.list_active().await?.len();
        Ok(CoordinatorStats {
            active_sessions: active,
            events: self.events_accepted.load(Ordering::Relaxed),
            queue: self.queue.stats(),
        })
    }

    pub async fn session_stats(&self, session_id: &str) -> Result<SessionStats> {
        let doc = self.sessions.get(session_id).await?;
        Ok(SessionStats {
            session_id: doc.id.clone(),
            state: doc.state,
            agents: doc.agent_ids.len(),
            events: doc.next_seq.saturating_sub(1),
            events_since_checkpoint: doc.events_since_checkpoint,
        })
    }

    /// Probe every dependency and aggregate the outcome.
    pub async fn health_check(&self) -> Result<HealthReport> {
        let mut components = Vec::new();

        let started = Instant::now();
        let sessions_ok = self.sessions.ping().await;
        components.push(component_status("session-store", started, &sessions_ok));

        let started = Instant::now();
        let log_ok = self.log.ping().await;
        components.push(component_status("event-log", started, &log_ok));

        let started = Instant::now();
        let queue_ok = self.queue.ping().await;
        components.push(component_status("job-store", started, &queue_ok));

        components.push(ComponentStatus {
            name: "bus".to_string(),
            healthy: !self.bus.is_closed(),
            latency_ms: 0,
            detail: None,
        });

        let active = self.sessions.list_active().await.map(|s| s.len()).unwrap_or(0);
        let queue_stats = self.queue.stats();
        Ok(HealthReport {
            healthy: components.iter().all(|c| c.healthy),
            components,
            active_sessions: active,
            queue_depth: queue_stats.depth,
            dead_letters: self.queue.dead_letters().len(),
            checked_at: Utc::now(),
        })
    }

    /// Background stale-agent scan at the configured interval.
    pub fn start_stale_scanner(&self) {
        let mut guard = self.stale_scanner.lock();
        if guard.is_some() {
            return;
        }
        *guard = Some(
            self.registry
                .spawn_stale_scanner(self.config.stale_scan_interval()),
        );
    }

    /// Graceful shutdown with the default grace period.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        self.shutdown_with_grace(DEFAULT_SHUTDOWN_GRACE).await
    }

    /// Drain, checkpoint every active session with reason `"shutdown"`, close
    /// persistence, and record recovery data for the next run.
    #[instrument(skip(self), err)]
    pub async fn shutdown_with_grace(&self, grace: Duration) -> Result<ShutdownReport> {
        self.shutdown_phase.send_replace(ShutdownPhase::Initiated);
        self.shutting_down.store(true, Ordering::SeqCst);

        // Draining: emit_event now refuses with SHUTTING_DOWN; subscribers go
        // before the worker pool.
        self.shutdown_phase.send_replace(ShutdownPhase::Draining);
        if let Some(handle) = self.stale_scanner.lock().take() {
            handle.abort();
        }

        self.shutdown_phase.send_replace(ShutdownPhase::Checkpointing);
        let active = self.sessions.list_active().await.unwrap_or_default();
        let active_ids: Vec<String> = active.iter().map(|doc| doc.id.clone()).collect();
        let mut checkpoints_issued = 0;
        for doc in &active {
            let seeds = derive_seed_union(
                &*self.log,
                &doc.id,
                self.config.checkpoint_interval as usize,
            )
            .await
            .unwrap_or_default();
            if seeds.is_empty() {
                continue;
            }
            let request = CheckpointRequest::new(
                doc.id.clone(),
                seeds,
                "shutdown",
                clamp_hop_count(None),
                CheckpointTrigger::Shutdown,
            );
            if self.queue.enqueue(request).await.is_ok() {
                checkpoints_issued += 1;
            }
        }
        let drained = self.queue.idle(grace).await;

        self.shutdown_phase.send_replace(ShutdownPhase::Cleanup);
        let unfinished = self.queue.unfinished_job_ids();
        let recovery = RecoveryData {
            active_session_ids: active_ids.clone(),
            unfinished_job_ids: unfinished.clone(),
            recorded_at: Some(Utc::now()),
        };
        if let Err(err) = self.queue.save_recovery(&recovery).await {
            tracing::warn!(
                target: "sessionweave::manager",
                code = err.code(),
                "failed to persist recovery data"
            );
        }
        if drained {
            self.queue.drain().await;
        } else {
            // Grace expired: the worker lanes are force-cancelled, not left
            // running behind a closed bus.
            self.queue.abort();
        }
        self.bus.stop_listener().await;
        self.bus.close();

        let final_phase = if drained {
            ShutdownPhase::Complete
        } else {
            ShutdownPhase::Forced
        };
        self.shutdown_phase.send_replace(final_phase);
        Ok(ShutdownReport {
            final_phase,
            checkpoints_issued,
            active_session_ids: active_ids,
            unfinished_job_ids: unfinished,
        })
    }

    /// Recovery data left by the previous run, if any.
    pub async fn recovery_data(&self) -> Result<Option<RecoveryData>> {
        self.queue.load_recovery().await
    }

    fn guard_shutdown(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(CoordError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

fn component_status(name: &str, started: Instant, outcome: &Result<()>) -> ComponentStatus {
    ComponentStatus {
        name: name.to_string(),
        healthy: outcome.is_ok(),
        latency_ms: started.elapsed().as_millis() as u64,
        detail: outcome.as_ref().err().map(|e| e.to_string()),
    }
}

/// Union of `change_info.entity_ids` over the newest `window` events.
///
/// Entities referenced only by `state_transition` are deliberately excluded.
async fn derive_seed_union(
    log: &dyn EventLog,
    session_id: &str,
    window: usize,
) -> Result<Vec<EntityId>> {
    let recent = log.tail(session_id, window.max(1)).await?;
    let mut seeds: Vec<EntityId> = recent
        .iter()
        .flat_map(|event| event.change_info.entity_ids.iter().cloned())
        .collect();
    seeds.sort();
    seeds.dedup();
    Ok(seeds)
}

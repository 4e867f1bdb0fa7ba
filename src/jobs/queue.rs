//! Durable FIFO of checkpoint jobs with retry, dead-letter, and hydration.
//!
//! The queue runs from memory and mirrors every transition through the
//! attached [`JobStore`]. Jobs are dispatched to `concurrency` worker lanes;
//! a session id always hashes to the same lane, so jobs of one session
//! execute in enqueue order. Per-job transition exclusivity is guarded by the
//! internal job table: only a `queued` job can move to `running`, so no job
//! executes twice concurrently.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::instrument;

use super::persistence::JobStore;
use super::types::{CheckpointJob, CheckpointRequest, JobOutcome, JobStatus};
use super::worker::CheckpointWorker;
use crate::bus::{BusMessage, BusPayload, BusPublisher};
use crate::config::CoordinatorConfig;
use crate::errors::{CoordError, Result};
use crate::utils::ids::IdGenerator;

/// Ceiling on jobs held in memory; reaching it fails enqueues with
/// `QUEUE_FULL`.
pub const MAX_PENDING_JOBS: usize = 10_000;

/// Queue tuning, extracted from the coordinator config.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub retry_backoff_exponential: bool,
    /// Log a full job snapshot on every failed attempt.
    pub enable_failure_snapshots: bool,
}

impl QueueConfig {
    #[must_use]
    pub fn from_coordinator(config: &CoordinatorConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1) as usize,
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            retry_backoff_exponential: config.retry_backoff_exponential,
            enable_failure_snapshots: config.enable_failure_snapshots,
        }
    }

    fn delay_for_attempt(&self, attempts: u32) -> Duration {
        if self.retry_backoff_exponential {
            let factor = 2u32.saturating_pow(attempts.saturating_sub(1).min(16));
            self.retry_delay.saturating_mul(factor)
        } else {
            self.retry_delay
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            retry_backoff_exponential: false,
            enable_failure_snapshots: false,
        }
    }
}

/// Handle returned by [`CheckpointJobQueue::enqueue`]; resolves when the job
/// reaches a terminal state.
#[derive(Debug)]
pub struct JobTicket {
    pub job_id: String,
    completion: watch::Receiver<Option<JobOutcome>>,
}

impl JobTicket {
    /// Wait for the terminal outcome. `None` only if the queue was dropped
    /// before the job finished.
    pub async fn wait(mut self) -> Option<JobOutcome> {
        loop {
            let current = self.completion.borrow().clone();
            if current.is_some() {
                return current;
            }
            if self.completion.changed().await.is_err() {
                return self.completion.borrow().clone();
            }
        }
    }
}

/// Counters exposed to health reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs not yet terminal (queued, running, or awaiting retry).
    pub depth: usize,
    pub completed: u64,
    pub dead_lettered: u64,
}

pub struct CheckpointJobQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    jobs: Mutex<FxHashMap<String, CheckpointJob>>,
    dead: Mutex<Vec<String>>,
    lanes: Vec<flume::Sender<String>>,
    lane_receivers: Mutex<Option<Vec<flume::Receiver<String>>>>,
    store: Mutex<Arc<dyn JobStore>>,
    completions: Mutex<FxHashMap<String, watch::Sender<Option<JobOutcome>>>>,
    active: AtomicUsize,
    completed: AtomicUsize,
    dead_lettered: AtomicUsize,
    idle_notify: Notify,
    draining: AtomicBool,
    ids: IdGenerator,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl CheckpointJobQueue {
    #[must_use]
    pub fn new(config: QueueConfig, store: Arc<dyn JobStore>) -> Self {
        let concurrency = config.concurrency.max(1);
        let mut lanes = Vec::with_capacity(concurrency);
        let mut receivers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let (tx, rx) = flume::unbounded();
            lanes.push(tx);
            receivers.push(rx);
        }
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                config,
                jobs: Mutex::new(FxHashMap::default()),
                dead: Mutex::new(Vec::new()),
                lanes,
                lane_receivers: Mutex::new(Some(receivers)),
                store: Mutex::new(store),
                completions: Mutex::new(FxHashMap::default()),
                active: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                dead_lettered: AtomicUsize::new(0),
                idle_notify: Notify::new(),
                draining: AtomicBool::new(false),
                ids: IdGenerator::new(),
                workers: Mutex::new(Vec::new()),
                shutdown,
            }),
        }
    }

    /// Swap the persistence backend. Existing in-memory jobs are untouched;
    /// callers usually follow with [`hydrate_from_persistence`](Self::hydrate_from_persistence).
    pub fn attach_persistence(&self, store: Arc<dyn JobStore>) {
        *self.inner.store.lock() = store;
    }

    /// Persist and queue a checkpoint request.
    ///
    /// The record is written first; a persistence failure is fatal to this
    /// call and nothing is queued.
    #[instrument(skip(self, payload), fields(session_id = %payload.session_id), err)]
    pub async fn enqueue(&self, payload: CheckpointRequest) -> Result<JobTicket> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(CoordError::ShuttingDown);
        }
        let depth = self.depth();
        if depth >= MAX_PENDING_JOBS {
            return Err(CoordError::QueueFull { depth });
        }
        let job = CheckpointJob::new(self.inner.ids.job_id(), payload);
        let store = self.store();
        store.insert(&job).await?;
        Ok(self.admit(job))
    }

    /// Re-queue all non-terminal persisted jobs, ordered by `queued_at`.
    ///
    /// Idempotent per job id: records already known in memory are skipped, so
    /// a job is hydrated exactly once per restart.
    #[instrument(skip(self), err)]
    pub async fn hydrate_from_persistence(&self) -> Result<usize> {
        let store = self.store();
        let incomplete = store.load_incomplete().await?;
        let mut hydrated = 0;
        for mut job in incomplete {
            if self.inner.jobs.lock().contains_key(&job.id) {
                continue;
            }
            job.status = JobStatus::Queued;
            job.updated_at = Utc::now();
            self.admit(job);
            hydrated += 1;
        }
        tracing::info!(target: "sessionweave::jobs", hydrated, "queue hydrated from persistence");
        Ok(hydrated)
    }

    fn admit(&self, job: CheckpointJob) -> JobTicket {
        let (tx, rx) = watch::channel(None);
        let job_id = job.id.clone();
        let lane = lane_for(&job.payload.session_id, self.inner.lanes.len());
        self.inner
            .completions
            .lock()
            .insert(job_id.clone(), tx);
        self.inner.jobs.lock().insert(job_id.clone(), job);
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        // Unbounded lane; send only fails when the queue is gone entirely.
        let _ = self.inner.lanes[lane].send(job_id.clone());
        JobTicket {
            job_id,
            completion: rx,
        }
    }

    /// Spawn the worker lanes. Call once after construction (and after
    /// hydration when resuming).
    pub fn start(&self, worker: Arc<CheckpointWorker>, publisher: Arc<dyn BusPublisher>, coordination_channel: String) {
        let mut receivers = match self.inner.lane_receivers.lock().take() {
            Some(receivers) => receivers,
            None => return, // already started
        };
        let mut handles = self.inner.workers.lock();
        for rx in receivers.drain(..) {
            let inner = Arc::clone(&self.inner);
            let worker = Arc::clone(&worker);
            let publisher = Arc::clone(&publisher);
            let channel = coordination_channel.clone();
            let mut shutdown = self.inner.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        received = rx.recv_async() => match received {
                            Ok(job_id) => {
                                run_one(&inner, &worker, &publisher, &channel, &job_id).await;
                            }
                            Err(_) => break,
                        }
                    }
                }
            }));
        }
    }

    /// Stop accepting new jobs and wait for in-flight work to finish, then
    /// stop the worker lanes.
    pub async fn drain(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
        self.wait_idle().await;
        let _ = self.inner.shutdown.send(true);
        let handles: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Abrupt stop: worker lanes are killed without draining. Models a crash;
    /// persisted records keep whatever state they were in.
    pub fn abort(&self) {
        let _ = self.inner.shutdown.send(true);
        let handles: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
    }

    /// Wait until no job is queued or running, up to `timeout`. Returns
    /// whether the queue went idle.
    pub async fn idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
    }

    async fn wait_idle(&self) {
        loop {
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.inner.idle_notify.notified();
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Jobs currently dead-lettered, oldest first.
    pub fn dead_letters(&self) -> Vec<CheckpointJob> {
        let jobs = self.inner.jobs.lock();
        self.inner
            .dead
            .lock()
            .iter()
            .filter_map(|id| jobs.get(id).cloned())
            .collect()
    }

    /// Operator command: move a dead-lettered job back onto the queue with
    /// its attempt counter reset.
    #[instrument(skip(self), err)]
    pub async fn requeue_dead_letter(&self, job_id: &str) -> Result<JobTicket> {
        let mut job = {
            let jobs = self.inner.jobs.lock();
            let known = self.inner.dead.lock().iter().any(|id| id == job_id);
            if !known {
                return Err(CoordError::validation(format!(
                    "job {job_id} is not dead-lettered"
                )));
            }
            jobs.get(job_id).cloned().ok_or_else(|| {
                CoordError::validation(format!("job {job_id} is not dead-lettered"))
            })?
        };
        let store = self.store();
        store.remove_dead_letter(job_id).await?;
        job.attempts = 0;
        job.status = JobStatus::Queued;
        job.last_error = None;
        job.updated_at = Utc::now();
        store.insert(&job).await?;
        self.inner.dead.lock().retain(|id| id != job_id);
        self.inner.jobs.lock().remove(job_id);
        self.inner.completions.lock().remove(job_id);
        Ok(self.admit(job))
    }

    /// Ids of jobs that are not yet terminal, for recovery data.
    pub fn unfinished_job_ids(&self) -> Vec<String> {
        let jobs = self.inner.jobs.lock();
        let mut ids: Vec<(chrono::DateTime<Utc>, String)> = jobs
            .values()
            .filter(|job| !job.status.is_terminal())
            .map(|job| (job.queued_at, job.id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn get_job(&self, job_id: &str) -> Option<CheckpointJob> {
        self.inner.jobs.lock().get(job_id).cloned()
    }

    pub fn depth(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.depth(),
            completed: self.inner.completed.load(Ordering::SeqCst) as u64,
            dead_lettered: self.inner.dead_lettered.load(Ordering::SeqCst) as u64,
        }
    }

    pub async fn save_recovery(&self, data: &super::persistence::RecoveryData) -> Result<()> {
        self.store().save_recovery(data).await
    }

    pub async fn load_recovery(&self) -> Result<Option<super::persistence::RecoveryData>> {
        self.store().load_recovery().await
    }

    pub async fn ping(&self) -> Result<()> {
        self.store().ping().await
    }

    fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.inner.store.lock())
    }
}

fn lane_for(session_id: &str, lanes: usize) -> usize {
    let mut hasher = FxHasher::default();
    session_id.hash(&mut hasher);
    (hasher.finish() as usize) % lanes.max(1)
}

/// Execute one job id pulled from a lane.
async fn run_one(
    inner: &Arc<QueueInner>,
    worker: &Arc<CheckpointWorker>,
    publisher: &Arc<dyn BusPublisher>,
    channel: &str,
    job_id: &str,
) {
    // Transition queued -> running under the job-table lock; anything else in
    // flight (or already terminal) means this delivery is a duplicate.
    let job = {
        let mut jobs = inner.jobs.lock();
        match jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Running;
                job.attempts += 1;
                job.updated_at = Utc::now();
                job.clone()
            }
            _ => return,
        }
    };
    persist_transition(inner, &job).await;

    let final_attempt = job.attempts >= inner.config.max_attempts;
    let outcome = worker.execute(&job, final_attempt).await;
    // Carry the surviving checkpoint id so a retry reuses it instead of
    // creating another.
    {
        let mut jobs = inner.jobs.lock();
        if let Some(stored) = jobs.get_mut(job_id) {
            stored.checkpoint_id = outcome.checkpoint_id.clone();
        }
    }
    match outcome.result {
        Ok(checkpoint_id) => {
            {
                let mut jobs = inner.jobs.lock();
                if let Some(stored) = jobs.get_mut(job_id) {
                    stored.status = JobStatus::Completed;
                    stored.updated_at = Utc::now();
                }
            }
            let store = Arc::clone(&*inner.store.lock());
            if let Err(err) = store.delete(job_id).await {
                tracing::warn!(
                    target: "sessionweave::jobs",
                    job_id,
                    code = err.code(),
                    "failed to delete completed job record"
                );
            }
            inner.completed.fetch_add(1, Ordering::SeqCst);
            publish(
                publisher,
                channel,
                BusPayload::JobCompleted {
                    job_id: job.id.clone(),
                    session_id: job.payload.session_id.clone(),
                    checkpoint_id: checkpoint_id.clone(),
                },
            );
            settle(inner, job_id, JobOutcome::Completed { checkpoint_id });
        }
        Err(err) => {
            let message = err.to_string();
            let attempts = job.attempts;
            if inner.config.enable_failure_snapshots {
                if let Ok(snapshot) = serde_json::to_string(&job) {
                    tracing::info!(
                        target: "sessionweave::jobs::snapshots",
                        job_id,
                        snapshot = %snapshot,
                        "failure snapshot"
                    );
                }
            }
            if attempts < inner.config.max_attempts {
                let stored = {
                    let mut jobs = inner.jobs.lock();
                    jobs.get_mut(job_id).map(|stored| {
                        stored.status = JobStatus::PendingRetry;
                        stored.last_error = Some(message.clone());
                        stored.updated_at = Utc::now();
                        stored.clone()
                    })
                };
                if let Some(stored) = stored {
                    persist_transition(inner, &stored).await;
                }
                publish(
                    publisher,
                    channel,
                    BusPayload::JobAttemptFailed {
                        job_id: job.id.clone(),
                        session_id: job.payload.session_id.clone(),
                        attempt: attempts,
                        error: message.clone(),
                    },
                );
                schedule_retry(inner, job_id.to_string(), attempts, &job.payload);
            } else {
                let stored = {
                    let mut jobs = inner.jobs.lock();
                    jobs.get_mut(job_id).map(|stored| {
                        stored.status = JobStatus::ManualIntervention;
                        stored.last_error = Some(message.clone());
                        stored.updated_at = Utc::now();
                        stored.clone()
                    })
                };
                if let Some(stored) = stored {
                    persist_transition(inner, &stored).await;
                    let store = Arc::clone(&*inner.store.lock());
                    if let Err(err) = store.insert_dead_letter(&stored).await {
                        tracing::warn!(
                            target: "sessionweave::jobs",
                            job_id,
                            code = err.code(),
                            "failed to persist dead letter"
                        );
                    }
                }
                inner.dead.lock().push(job_id.to_string());
                inner.dead_lettered.fetch_add(1, Ordering::SeqCst);
                publish(
                    publisher,
                    channel,
                    BusPayload::JobFailed {
                        job_id: job.id.clone(),
                        session_id: job.payload.session_id.clone(),
                        error: message.clone(),
                    },
                );
                publish(
                    publisher,
                    channel,
                    BusPayload::JobDeadLettered {
                        job_id: job.id.clone(),
                        session_id: job.payload.session_id.clone(),
                    },
                );
                settle(inner, job_id, JobOutcome::DeadLettered { error: message });
            }
        }
    }
}

/// Re-queue a failed job on its session lane after the configured delay.
fn schedule_retry(
    inner: &Arc<QueueInner>,
    job_id: String,
    attempts: u32,
    payload: &CheckpointRequest,
) {
    use rand::Rng;
    let base = inner.config.delay_for_attempt(attempts);
    // Small jitter so jobs failing in lockstep don't retry in lockstep.
    let jitter = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 10).max(1));
    let delay = base + Duration::from_millis(jitter);
    let lane = lane_for(&payload.session_id, inner.lanes.len());
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let stored = {
            let mut jobs = inner.jobs.lock();
            match jobs.get_mut(&job_id) {
                Some(job) if job.status == JobStatus::PendingRetry => {
                    job.status = JobStatus::Queued;
                    job.updated_at = Utc::now();
                    job.clone()
                }
                _ => return,
            }
        };
        persist_transition(&inner, &stored).await;
        let _ = inner.lanes[lane].send(job_id);
    });
}

/// Mirror a transition to the store; failures are logged, never fatal.
async fn persist_transition(inner: &Arc<QueueInner>, job: &CheckpointJob) {
    let store = inner.store.lock().clone();
    if let Err(err) = store.update(job).await {
        tracing::warn!(
            target: "sessionweave::jobs",
            job_id = %job.id,
            status = %job.status,
            code = err.code(),
            "failed to persist job transition"
        );
    }
}

fn settle(inner: &Arc<QueueInner>, job_id: &str, outcome: JobOutcome) {
    if let Some(tx) = inner.completions.lock().remove(job_id) {
        let _ = tx.send(Some(outcome));
    }
    inner.active.fetch_sub(1, Ordering::SeqCst);
    inner.idle_notify.notify_waiters();
}

fn publish(publisher: &Arc<dyn BusPublisher>, channel: &str, payload: BusPayload) {
    if let Err(err) = publisher.publish(BusMessage::new(channel, payload)) {
        tracing::debug!(
            target: "sessionweave::jobs",
            error = %err,
            "job notice publish failed"
        );
    }
}

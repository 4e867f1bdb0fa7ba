//! Session store trait and the in-memory reference implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::types::{AppendTicket, LeaveOutcome, SessionDocument, SessionOptions, SessionState};
use crate::errors::{CoordError, Result};
use crate::utils::ids::IdGenerator;

/// Persistent mapping `session_id -> SessionDocument`.
///
/// Implementations must serialize concurrent mutations of one session so that
/// sequence reservation stays strictly monotonic. Reads tolerate transient
/// backend errors with bounded backoff (see `utils::retry`); writes are
/// fail-fast with a typed error.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session with the given creator agent already joined.
    async fn create(&self, agent_id: &str, opts: SessionOptions) -> Result<SessionDocument>;

    /// Fetch a session. Succeeds during the grace window; fails with
    /// `SESSION_NOT_FOUND` once the record is purged.
    async fn get(&self, session_id: &str) -> Result<SessionDocument>;

    async fn join(&self, session_id: &str, agent_id: &str) -> Result<SessionDocument>;

    async fn leave(&self, session_id: &str, agent_id: &str) -> Result<LeaveOutcome>;

    async fn list_active(&self) -> Result<Vec<SessionDocument>>;

    async fn by_agent(&self, agent_id: &str) -> Result<Vec<SessionDocument>>;

    /// Refresh the TTL without recording an event.
    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Pause or resume a session. Closed sessions cannot change state.
    async fn set_state(&self, session_id: &str, state: SessionState) -> Result<()>;

    async fn close(&self, session_id: &str, reason: &str) -> Result<SessionDocument>;

    /// Atomically assign the next sequence number for an append by `actor`,
    /// bump activity, refresh the TTL, and count toward the checkpoint
    /// interval.
    async fn reserve_seq(
        &self,
        session_id: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<AppendTicket>;

    /// Reset the events-since-checkpoint counter after a checkpoint enqueue.
    async fn reset_checkpoint_counter(&self, session_id: &str) -> Result<()>;

    /// Liveness probe of the backing store.
    async fn ping(&self) -> Result<()>;
}

/// Volatile process-local session store. Fast, non-durable; the default for
/// tests and single-process hosts.
pub struct InMemorySessionStore {
    inner: Mutex<FxHashMap<String, SessionDocument>>,
    ids: IdGenerator,
    default_ttl: u64,
    default_grace: u64,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new(default_ttl: u64, default_grace: u64) -> Self {
        Self {
            inner: Mutex::new(FxHashMap::default()),
            ids: IdGenerator::new(),
            default_ttl,
            default_grace,
        }
    }

    /// Purge-or-close bookkeeping applied lazily on access.
    fn settle(doc: &mut SessionDocument, now: DateTime<Utc>) {
        if doc.state != SessionState::Closed && doc.empty_grace_elapsed(now) {
            doc.state = SessionState::Closed;
            doc.closed_reason.get_or_insert_with(|| "all agents left".to_string());
        }
    }

    fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionDocument) -> Result<T>,
    ) -> Result<T> {
        let now = Utc::now();
        let mut map = self.inner.lock();
        let purge = match map.get_mut(session_id) {
            Some(doc) => {
                if doc.is_purgeable(now) {
                    true
                } else {
                    Self::settle(doc, now);
                    return f(doc);
                }
            }
            None => false,
        };
        if purge {
            map.remove(session_id);
        }
        Err(CoordError::SessionNotFound {
            session_id: session_id.to_string(),
        })
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, agent_id: &str, opts: SessionOptions) -> Result<SessionDocument> {
        if agent_id.is_empty() {
            return Err(CoordError::validation("agent id must be non-empty"));
        }
        let id = self.ids.session_id();
        let doc = SessionDocument::new(
            id.clone(),
            agent_id.to_string(),
            opts,
            self.default_ttl,
            self.default_grace,
        );
        self.inner.lock().insert(id, doc.clone());
        Ok(doc)
    }

    async fn get(&self, session_id: &str) -> Result<SessionDocument> {
        self.with_session(session_id, |doc| Ok(doc.clone()))
    }

    async fn join(&self, session_id: &str, agent_id: &str) -> Result<SessionDocument> {
        let now = Utc::now();
        self.with_session(session_id, |doc| {
            if doc.state == SessionState::Closed {
                return Err(CoordError::validation(format!(
                    "session {session_id} is closed"
                )));
            }
            if doc.is_expired(now) {
                return Err(CoordError::SessionExpired {
                    session_id: session_id.to_string(),
                });
            }
            doc.agent_ids.insert(agent_id.to_string());
            doc.empty_since = None;
            if doc.state == SessionState::Paused && doc.closed_reason.is_none() {
                doc.state = SessionState::Active;
            }
            Ok(doc.clone())
        })
    }

    async fn leave(&self, session_id: &str, agent_id: &str) -> Result<LeaveOutcome> {
        self.with_session(session_id, |doc| {
            if !doc.agent_ids.remove(agent_id) {
                return Err(CoordError::ActorNotJoined {
                    session_id: session_id.to_string(),
                    agent_id: agent_id.to_string(),
                });
            }
            let last_agent_left = doc.agent_ids.is_empty();
            if last_agent_left {
                // An active session must have members; park it until the
                // grace window closes it for good.
                doc.empty_since = Some(Utc::now());
                if doc.state == SessionState::Active {
                    doc.state = SessionState::Paused;
                }
            }
            Ok(LeaveOutcome {
                remaining_agents: doc.agent_ids.len(),
                last_agent_left,
            })
        })
    }

    async fn list_active(&self) -> Result<Vec<SessionDocument>> {
        let now = Utc::now();
        let mut map = self.inner.lock();
        map.retain(|_, doc| !doc.is_purgeable(now));
        let mut active: Vec<SessionDocument> = map
            .values_mut()
            .map(|doc| {
                Self::settle(doc, now);
                doc.clone()
            })
            .filter(|doc| doc.state == SessionState::Active && !doc.is_expired(now))
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    async fn by_agent(&self, agent_id: &str) -> Result<Vec<SessionDocument>> {
        let now = Utc::now();
        let map = self.inner.lock();
        let mut sessions: Vec<SessionDocument> = map
            .values()
            .filter(|doc| !doc.is_purgeable(now) && doc.has_agent(agent_id))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_session(session_id, |doc| {
            doc.last_activity_at = at;
            Ok(())
        })
    }

    async fn set_state(&self, session_id: &str, state: SessionState) -> Result<()> {
        self.with_session(session_id, |doc| {
            if doc.state == SessionState::Closed {
                return Err(CoordError::validation(format!(
                    "session {session_id} is closed"
                )));
            }
            doc.state = state;
            Ok(())
        })
    }

    async fn close(&self, session_id: &str, reason: &str) -> Result<SessionDocument> {
        self.with_session(session_id, |doc| {
            doc.state = SessionState::Closed;
            doc.closed_reason = Some(reason.to_string());
            Ok(doc.clone())
        })
    }

    async fn reserve_seq(
        &self,
        session_id: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<AppendTicket> {
        self.with_session(session_id, |doc| {
            match doc.state {
                SessionState::Closed => {
                    return Err(CoordError::validation(format!(
                        "session {session_id} is closed"
                    )))
                }
                SessionState::Paused => {
                    return Err(CoordError::validation(format!(
                        "session {session_id} is paused"
                    )))
                }
                SessionState::Active => {}
            }
            if doc.is_expired(at) {
                return Err(CoordError::SessionExpired {
                    session_id: session_id.to_string(),
                });
            }
            if !doc.has_agent(actor) {
                return Err(CoordError::ActorNotJoined {
                    session_id: session_id.to_string(),
                    agent_id: actor.to_string(),
                });
            }
            let seq = doc.next_seq;
            doc.next_seq += 1;
            doc.last_activity_at = at;
            doc.events_since_checkpoint += 1;
            Ok(AppendTicket {
                seq,
                events_since_checkpoint: doc.events_since_checkpoint,
            })
        })
    }

    async fn reset_checkpoint_counter(&self, session_id: &str) -> Result<()> {
        self.with_session(session_id, |doc| {
            doc.events_since_checkpoint = 0;
            Ok(())
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

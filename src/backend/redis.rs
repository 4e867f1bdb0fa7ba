//! Redis-backed session store and event log.
//!
//! Key layout:
//! - `session:{id}` — hash with a `doc` field (JSON session document), a
//!   `next_seq` counter, and a TTL covering expiry plus the grace window.
//! - `events:{id}` — sorted set of event JSON scored by `seq`.
//!
//! Sequence assignment rides on `HINCRBY`, which serializes concurrent
//! appenders on the server; the session-document update that follows is
//! last-writer-wins metadata only. The event write itself is a conditional
//! append against the stream tail with bounded retries (`CONTENTION` once
//! they are spent). Reads run through the bounded-backoff helper, so
//! transient connection errors surface as `BACKEND_UNAVAILABLE` only after
//! the retries are spent.

use std::io::{self, Result as IoResult};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};

use crate::bus::{BusMessage, MessageSink};
use crate::errors::{CoordError, Result};
use crate::event::SessionEvent;
use crate::log::{EventLog, DEFAULT_RANGE_TAIL};
use crate::sessions::{
    AppendTicket, LeaveOutcome, SessionDocument, SessionOptions, SessionState, SessionStore,
};
use crate::utils::ids::IdGenerator;
use crate::utils::json_ext::{deserialize_json, serialize_json};
use crate::utils::retry::{
    conditional_append, with_backoff, DEFAULT_APPEND_RETRIES, DEFAULT_READ_ATTEMPTS,
};

const READ_BACKOFF: Duration = Duration::from_millis(50);

fn backend_err(context: &str, err: redis::RedisError) -> CoordError {
    CoordError::backend(format!("{context}: {err}"))
}

/// Redis implementation of [`SessionStore`] and [`EventLog`].
pub struct RedisBackend {
    client: Client,
    ids: IdGenerator,
    default_ttl: u64,
    default_grace: u64,
    max_events_per_session: usize,
}

impl RedisBackend {
    /// Connect to the Redis-shaped backend at `url`.
    pub async fn connect(
        url: &str,
        default_ttl: u64,
        default_grace: u64,
        max_events_per_session: usize,
    ) -> Result<Self> {
        let client =
            Client::open(url).map_err(|e| CoordError::backend(format!("redis open: {e}")))?;
        let backend = Self {
            client,
            ids: IdGenerator::new(),
            default_ttl,
            default_grace,
            max_events_per_session: max_events_per_session.max(1),
        };
        backend.ping_once().await?;
        Ok(backend)
    }

    async fn conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| backend_err("redis connect", e))
    }

    async fn ping_once(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("redis ping", e))?;
        Ok(())
    }

    fn session_key(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    fn events_key(session_id: &str) -> String {
        format!("events:{session_id}")
    }

    async fn read_doc(&self, session_id: &str) -> Result<SessionDocument> {
        let key = Self::session_key(session_id);
        let raw: Option<String> = with_backoff(DEFAULT_READ_ATTEMPTS, READ_BACKOFF, || async {
            let mut conn = self.conn().await?;
            conn.hget(&key, "doc")
                .await
                .map_err(|e| backend_err("hget session doc", e))
        })
        .await?;
        let raw = raw.ok_or_else(|| CoordError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
        let doc: SessionDocument = deserialize_json(&raw, "session document")?;
        if doc.is_purgeable(Utc::now()) {
            return Err(CoordError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        Ok(doc)
    }

    async fn write_doc(&self, doc: &SessionDocument) -> Result<()> {
        let key = Self::session_key(&doc.id);
        let raw = serialize_json(doc, "session document")?;
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(&key, "doc", raw)
            .await
            .map_err(|e| backend_err("hset session doc", e))?;
        // The counter is only seeded once; later increments happen through
        // HINCRBY so concurrent appenders never clobber it.
        let _: bool = conn
            .hset_nx(&key, "next_seq", doc.next_seq)
            .await
            .map_err(|e| backend_err("hsetnx next_seq", e))?;
        self.refresh_ttl(&mut conn, doc).await
    }

    async fn refresh_ttl(
        &self,
        conn: &mut MultiplexedConnection,
        doc: &SessionDocument,
    ) -> Result<()> {
        if doc.ttl_seconds == 0 {
            return Ok(());
        }
        let total = doc.ttl_seconds.saturating_add(doc.grace_ttl_seconds) as i64;
        let _: () = conn
            .expire(Self::session_key(&doc.id), total)
            .await
            .map_err(|e| backend_err("expire session", e))?;
        let _: () = conn
            .expire(Self::events_key(&doc.id), total)
            .await
            .map_err(|e| backend_err("expire events", e))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for RedisBackend {
    async fn create(&self, agent_id: &str, opts: SessionOptions) -> Result<SessionDocument> {
        if agent_id.is_empty() {
            return Err(CoordError::validation("agent id must be non-empty"));
        }
        let doc = SessionDocument::new(
            self.ids.session_id(),
            agent_id.to_string(),
            opts,
            self.default_ttl,
            self.default_grace,
        );
        self.write_doc(&doc).await?;
        Ok(doc)
    }

    async fn get(&self, session_id: &str) -> Result<SessionDocument> {
        self.read_doc(session_id).await
    }

    async fn join(&self, session_id: &str, agent_id: &str) -> Result<SessionDocument> {
        let mut doc = self.read_doc(session_id).await?;
        if doc.state == SessionState::Closed {
            return Err(CoordError::validation(format!(
                "session {session_id} is closed"
            )));
        }
        if doc.is_expired(Utc::now()) {
            return Err(CoordError::SessionExpired {
                session_id: session_id.to_string(),
            });
        }
        doc.agent_ids.insert(agent_id.to_string());
        doc.empty_since = None;
        if doc.state == SessionState::Paused && doc.closed_reason.is_none() {
            doc.state = SessionState::Active;
        }
        self.write_doc(&doc).await?;
        Ok(doc)
    }

    async fn leave(&self, session_id: &str, agent_id: &str) -> Result<LeaveOutcome> {
        let mut doc = self.read_doc(session_id).await?;
        if !doc.agent_ids.remove(agent_id) {
            return Err(CoordError::ActorNotJoined {
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
            });
        }
        let last_agent_left = doc.agent_ids.is_empty();
        if last_agent_left {
            doc.empty_since = Some(Utc::now());
            if doc.state == SessionState::Active {
                doc.state = SessionState::Paused;
            }
        }
        let remaining = doc.agent_ids.len();
        self.write_doc(&doc).await?;
        Ok(LeaveOutcome {
            remaining_agents: remaining,
            last_agent_left,
        })
    }

    async fn list_active(&self) -> Result<Vec<SessionDocument>> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn
            .keys("session:*")
            .await
            .map_err(|e| backend_err("keys session:*", e))?;
        let now = Utc::now();
        let mut active = Vec::new();
        for key in keys {
            let raw: Option<String> = conn
                .hget(&key, "doc")
                .await
                .map_err(|e| backend_err("hget session doc", e))?;
            if let Some(raw) = raw {
                let doc: SessionDocument = deserialize_json(&raw, "session document")?;
                if doc.state == SessionState::Active && !doc.is_expired(now) {
                    active.push(doc);
                }
            }
        }
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    async fn by_agent(&self, agent_id: &str) -> Result<Vec<SessionDocument>> {
        let mut sessions = self.list_active().await?;
        sessions.retain(|doc| doc.has_agent(agent_id));
        Ok(sessions)
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut doc = self.read_doc(session_id).await?;
        doc.last_activity_at = at;
        self.write_doc(&doc).await
    }

    async fn set_state(&self, session_id: &str, state: SessionState) -> Result<()> {
        let mut doc = self.read_doc(session_id).await?;
        if doc.state == SessionState::Closed {
            return Err(CoordError::validation(format!(
                "session {session_id} is closed"
            )));
        }
        doc.state = state;
        self.write_doc(&doc).await
    }

    async fn close(&self, session_id: &str, reason: &str) -> Result<SessionDocument> {
        let mut doc = self.read_doc(session_id).await?;
        doc.state = SessionState::Closed;
        doc.closed_reason = Some(reason.to_string());
        self.write_doc(&doc).await?;
        Ok(doc)
    }

    async fn reserve_seq(
        &self,
        session_id: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<AppendTicket> {
        let mut doc = self.read_doc(session_id).await?;
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
        // HINCRBY serializes concurrent appenders on the server side; the
        // counter was seeded at next_seq, so the first increment yields 1.
        let mut conn = self.conn().await?;
        let next: i64 = conn
            .hincr(Self::session_key(session_id), "next_seq", 1)
            .await
            .map_err(|e| backend_err("hincrby next_seq", e))?;
        let seq = (next - 1).max(1) as u64;
        doc.next_seq = next as u64;
        doc.last_activity_at = at;
        doc.events_since_checkpoint += 1;
        self.write_doc(&doc).await?;
        Ok(AppendTicket {
            seq,
            events_since_checkpoint: doc.events_since_checkpoint,
        })
    }

    async fn reset_checkpoint_counter(&self, session_id: &str) -> Result<()> {
        let mut doc = self.read_doc(session_id).await?;
        doc.events_since_checkpoint = 0;
        self.write_doc(&doc).await
    }

    async fn ping(&self) -> Result<()> {
        self.ping_once().await
    }
}

#[async_trait]
impl EventLog for RedisBackend {
    async fn append(&self, session_id: &str, event: SessionEvent) -> Result<u64> {
        let key = Self::events_key(session_id);
        let raw = serialize_json(&event, "session event")?;
        let seq = event.seq;
        let max_retained = self.max_events_per_session as i64;
        // Conditional write against the stream tail: the ZADD only happens
        // when this event is the direct successor of the last stored one.
        // A reservation that ran ahead of a slower concurrent appender loses
        // the round and retries; exhausting the retries is CONTENTION.
        conditional_append(session_id, DEFAULT_APPEND_RETRIES, || {
            let key = key.clone();
            let raw = raw.clone();
            async move {
                let mut conn = self.conn().await?;
                let last: Vec<(String, f64)> = conn
                    .zrange_withscores(&key, -1, -1)
                    .await
                    .map_err(|e| backend_err("zrange last", e))?;
                if let Some((_, score)) = last.first() {
                    let last_seq = *score as u64;
                    if seq <= last_seq {
                        // Already past this sequence number: a genuine
                        // ordering violation, not a lost race.
                        return Err(CoordError::SequenceGap {
                            session_id: session_id.to_string(),
                            expected: last_seq + 1,
                            got: seq,
                        });
                    }
                    if seq > last_seq + 1 {
                        // An earlier reservation has not landed yet.
                        return Ok(None);
                    }
                }
                let _: () = conn
                    .zadd(&key, raw, seq)
                    .await
                    .map_err(|e| backend_err("zadd event", e))?;
                let over = {
                    let len: i64 = conn
                        .zcard(&key)
                        .await
                        .map_err(|e| backend_err("zcard events", e))?;
                    len - max_retained
                };
                if over > 0 {
                    let _: () = conn
                        .zremrangebyrank(&key, 0, (over - 1) as isize)
                        .await
                        .map_err(|e| backend_err("zremrangebyrank", e))?;
                }
                Ok(Some(seq))
            }
        })
        .await
    }

    async fn range(
        &self,
        session_id: &str,
        from_seq: u64,
        to_seq: Option<u64>,
    ) -> Result<Vec<SessionEvent>> {
        let key = Self::events_key(session_id);
        let upper = to_seq.map_or("+inf".to_string(), |s| s.to_string());
        let raws: Vec<String> = with_backoff(DEFAULT_READ_ATTEMPTS, READ_BACKOFF, || async {
            let mut conn = self.conn().await?;
            conn.zrangebyscore(&key, from_seq, upper.clone())
                .await
                .map_err(|e| backend_err("zrangebyscore", e))
        })
        .await?;
        let mut events = raws
            .iter()
            .map(|raw| deserialize_json::<SessionEvent>(raw, "session event"))
            .collect::<Result<Vec<_>>>()?;
        if to_seq.is_none() && events.len() > DEFAULT_RANGE_TAIL {
            events = events.split_off(events.len() - DEFAULT_RANGE_TAIL);
        }
        for pair in events.windows(2) {
            if pair[1].seq != pair[0].seq + 1 {
                return Err(CoordError::SequenceGap {
                    session_id: session_id.to_string(),
                    expected: pair[0].seq + 1,
                    got: pair[1].seq,
                });
            }
        }
        Ok(events)
    }

    async fn tail(&self, session_id: &str, count: usize) -> Result<Vec<SessionEvent>> {
        let key = Self::events_key(session_id);
        let mut conn = self.conn().await?;
        let raws: Vec<String> = conn
            .zrange(&key, -(count as isize), -1)
            .await
            .map_err(|e| backend_err("zrange tail", e))?;
        raws.iter()
            .map(|raw| deserialize_json::<SessionEvent>(raw, "session event"))
            .collect()
    }

    async fn trim(&self, session_id: &str, keep_tail: usize) -> Result<usize> {
        let key = Self::events_key(session_id);
        let mut conn = self.conn().await?;
        let len: i64 = conn
            .zcard(&key)
            .await
            .map_err(|e| backend_err("zcard events", e))?;
        let over = len - keep_tail as i64;
        if over <= 0 {
            return Ok(0);
        }
        let _: () = conn
            .zremrangebyrank(&key, 0, (over - 1) as isize)
            .await
            .map_err(|e| backend_err("zremrangebyrank", e))?;
        Ok(over as usize)
    }

    async fn len(&self, session_id: &str) -> Result<usize> {
        let mut conn = self.conn().await?;
        let len: i64 = conn
            .zcard(Self::events_key(session_id))
            .await
            .map_err(|e| backend_err("zcard events", e))?;
        Ok(len as usize)
    }

    async fn purge(&self, session_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .del(Self::events_key(session_id))
            .await
            .map_err(|e| backend_err("del events", e))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.ping_once().await
    }
}

/// Bus sink that mirrors every message onto a Redis channel, giving
/// cross-process subscribers the same at-least-once stream.
pub struct RedisPublishSink {
    tx: flume::Sender<BusMessage>,
}

impl RedisPublishSink {
    /// Spawn the forwarding task and return the sink to attach to the bus.
    pub fn spawn(client: Client) -> Self {
        let (tx, rx) = flume::unbounded::<BusMessage>();
        tokio::spawn(async move {
            let mut conn = match client.get_multiplexed_async_connection().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(
                        target: "sessionweave::backend",
                        error = %err,
                        "redis publish bridge failed to connect"
                    );
                    return;
                }
            };
            while let Ok(message) = rx.recv_async().await {
                let payload = match serde_json::to_string(&message.to_wire()) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                let result: redis::RedisResult<()> =
                    conn.publish(message.channel.clone(), payload).await;
                if let Err(err) = result {
                    tracing::warn!(
                        target: "sessionweave::backend",
                        error = %err,
                        channel = %message.channel,
                        "redis publish failed"
                    );
                }
            }
        });
        Self { tx }
    }
}

impl MessageSink for RedisPublishSink {
    fn handle(&mut self, message: &BusMessage) -> IoResult<()> {
        self.tx
            .send(message.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "publish bridge stopped"))
    }

    fn name(&self) -> String {
        "RedisPublishSink".to_string()
    }
}

//! Session documents and membership records.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::AgentId;

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Paused,
    Closed,
}

impl SessionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Closed => "closed",
        }
    }
}

/// Options accepted when creating a session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Override of the configured TTL, in seconds. `0` disables expiry.
    pub ttl_seconds: Option<u64>,
    pub grace_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

/// The authoritative record of one session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionDocument {
    pub id: String,
    pub state: SessionState,
    pub agent_ids: BTreeSet<AgentId>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub grace_ttl_seconds: u64,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
    /// Next sequence number to assign; the first event gets 1.
    pub next_seq: u64,
    /// Events appended since the last checkpoint enqueue.
    pub events_since_checkpoint: u32,
    /// Set when the last agent leaves; the session closes once the grace
    /// window elapses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_reason: Option<String>,
}

impl SessionDocument {
    #[must_use]
    pub fn new(id: String, creator: AgentId, opts: SessionOptions, default_ttl: u64, default_grace: u64) -> Self {
        let now = Utc::now();
        let mut agent_ids = BTreeSet::new();
        agent_ids.insert(creator);
        Self {
            id,
            state: SessionState::Active,
            agent_ids,
            created_at: now,
            last_activity_at: now,
            ttl_seconds: opts.ttl_seconds.unwrap_or(default_ttl),
            grace_ttl_seconds: opts.grace_ttl_seconds.unwrap_or(default_grace),
            metadata: opts.metadata,
            next_seq: 1,
            events_since_checkpoint: 0,
            empty_since: None,
            closed_reason: None,
        }
    }

    /// True once the TTL elapsed; writes are refused from this point.
    ///
    /// A TTL of 0 disables expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_seconds == 0 {
            return false;
        }
        now > self.last_activity_at + ChronoDuration::seconds(self.ttl_seconds as i64)
    }

    /// True once the grace window after expiry also elapsed; the record is
    /// purged and reads start failing.
    #[must_use]
    pub fn is_purgeable(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_seconds == 0 {
            return false;
        }
        let total = self.ttl_seconds.saturating_add(self.grace_ttl_seconds) as i64;
        now > self.last_activity_at + ChronoDuration::seconds(total)
    }

    /// True once an emptied session passed its grace window and should close.
    #[must_use]
    pub fn empty_grace_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.empty_since {
            Some(since) => {
                now > since + ChronoDuration::seconds(self.grace_ttl_seconds as i64)
            }
            None => false,
        }
    }

    #[must_use]
    pub fn has_agent(&self, agent_id: &str) -> bool {
        self.agent_ids.contains(agent_id)
    }
}

/// Result of removing an agent from a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub remaining_agents: usize,
    /// The departing agent was the last member; the session will close once
    /// the grace window elapses.
    pub last_agent_left: bool,
}

/// Outcome of reserving the next sequence number for an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendTicket {
    pub seq: u64,
    pub events_since_checkpoint: u32,
}

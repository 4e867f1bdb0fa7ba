//! Messages carried on the coordination bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{AgentId, SessionEvent};

/// Payload of a bus message.
///
/// Session event payloads serialize to the documented camelCase wire shape;
/// lifecycle notices are tagged by `kind`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BusPayload {
    #[serde(rename_all = "camelCase")]
    SessionEvent {
        session_id: String,
        event: SessionEvent,
    },
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        session_id: String,
        agent_id: AgentId,
    },
    #[serde(rename_all = "camelCase")]
    SessionClosed { session_id: String, reason: String },
    #[serde(rename_all = "camelCase")]
    Handoff {
        session_id: String,
        agent_id: AgentId,
        joined: bool,
    },
    #[serde(rename_all = "camelCase")]
    JobCompleted {
        job_id: String,
        session_id: String,
        checkpoint_id: String,
    },
    #[serde(rename_all = "camelCase")]
    JobAttemptFailed {
        job_id: String,
        session_id: String,
        attempt: u32,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    JobFailed {
        job_id: String,
        session_id: String,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    JobDeadLettered { job_id: String, session_id: String },
    #[serde(rename_all = "camelCase")]
    AgentDead { agent_id: AgentId },
    #[serde(rename_all = "camelCase")]
    AgentHeartbeat {
        agent_id: AgentId,
        at: DateTime<Utc>,
    },
}

impl BusPayload {
    /// Short label used by formatters and log lines.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            BusPayload::SessionEvent { .. } => "sessionEvent",
            BusPayload::SessionCreated { .. } => "sessionCreated",
            BusPayload::SessionClosed { .. } => "sessionClosed",
            BusPayload::Handoff { .. } => "handoff",
            BusPayload::JobCompleted { .. } => "jobCompleted",
            BusPayload::JobAttemptFailed { .. } => "jobAttemptFailed",
            BusPayload::JobFailed { .. } => "jobFailed",
            BusPayload::JobDeadLettered { .. } => "jobDeadLettered",
            BusPayload::AgentDead { .. } => "agentDead",
            BusPayload::AgentHeartbeat { .. } => "agentHeartbeat",
        }
    }
}

/// A message addressed to one named channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: BusPayload,
}

impl BusMessage {
    pub fn new(channel: impl Into<String>, payload: BusPayload) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }

    /// Delivery is at-least-once; duplicated session events are recognised by
    /// this `(session_id, seq)` key. Lifecycle notices carry no key.
    #[must_use]
    pub fn dedupe_key(&self) -> Option<(String, u64)> {
        match &self.payload {
            BusPayload::SessionEvent { session_id, event } => {
                Some((session_id.clone(), event.seq))
            }
            _ => None,
        }
    }

    /// The JSON body delivered to external subscribers.
    ///
    /// Session events use the documented flat wire shape; everything else
    /// serializes as its tagged form.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match &self.payload {
            BusPayload::SessionEvent { session_id, event } => event.to_wire(session_id),
            other => serde_json::to_value(other).unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDraft;

    #[test]
    fn session_events_have_dedupe_keys() {
        let event = SessionEvent::from_draft(
            EventDraft::modified("function", vec!["f1".into()]),
            3,
            "agent-A",
        );
        let msg = BusMessage::new(
            "session:s1",
            BusPayload::SessionEvent {
                session_id: "s1".into(),
                event,
            },
        );
        assert_eq!(msg.dedupe_key(), Some(("s1".to_string(), 3)));

        let notice = BusMessage::new(
            "agent:coordination",
            BusPayload::JobDeadLettered {
                job_id: "j".into(),
                session_id: "s1".into(),
            },
        );
        assert_eq!(notice.dedupe_key(), None);
    }

    #[test]
    fn lifecycle_notices_are_kind_tagged() {
        let msg = BusMessage::new(
            "global:sessions",
            BusPayload::SessionClosed {
                session_id: "s1".into(),
                reason: "done".into(),
            },
        );
        let wire = msg.to_wire();
        assert_eq!(wire["kind"], "sessionClosed");
        assert_eq!(wire["sessionId"], "s1");
    }

    #[test]
    fn session_event_wire_is_flat() {
        let event = SessionEvent::from_draft(
            EventDraft::modified("module", vec!["m1".into()]),
            1,
            "agent-B",
        );
        let msg = BusMessage::new(
            "session:s2",
            BusPayload::SessionEvent {
                session_id: "s2".into(),
                event,
            },
        );
        let wire = msg.to_wire();
        assert_eq!(wire["sessionId"], "s2");
        assert_eq!(wire["seq"], 1);
        assert!(wire.get("kind").is_none());
    }
}

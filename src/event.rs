//! Session event model.
//!
//! Events are the immutable records agents exchange inside a session. An
//! [`EventDraft`] is what a caller hands to the facade; the facade stamps it
//! with the assigned sequence number, the acting agent, and a timestamp to
//! produce a [`SessionEvent`]. The wire shape published on the bus is the
//! camelCase JSON produced by [`SessionEvent::to_wire`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identifier of a participating agent.
pub type AgentId = String;

/// Stable identifier of a graph entity referenced by a change.
pub type EntityId = String;

/// Classification of a session event.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Modified,
    Broke,
    Fixed,
    Handoff,
    Checkpoint,
    Custom,
}

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Modified => "modified",
            EventType::Broke => "broke",
            EventType::Fixed => "fixed",
            EventType::Handoff => "handoff",
            EventType::Checkpoint => "checkpoint",
            EventType::Custom => "custom",
        }
    }

    /// Event types that force an immediate checkpoint regardless of the
    /// interval counter.
    #[must_use]
    pub fn forces_checkpoint(&self) -> bool {
        matches!(self, EventType::Broke | EventType::Fixed)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a change did to the referenced entities.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Created,
    Modified,
    Deleted,
    Failed,
    #[serde(untagged)]
    Other(String),
}

/// The change payload of an event: which entities were touched and how.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeInfo {
    /// Kind of code element the change targets (function, module, file, ...).
    pub element_type: String,
    pub entity_ids: Vec<EntityId>,
    pub operation: ChangeOperation,
}

impl ChangeInfo {
    pub fn new(
        element_type: impl Into<String>,
        entity_ids: Vec<EntityId>,
        operation: ChangeOperation,
    ) -> Self {
        Self {
            element_type: element_type.into(),
            entity_ids,
            operation,
        }
    }
}

/// Optional verified state transition attached to an event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_by: Option<String>,
    /// Verifier confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Caller-supplied portion of an event, before sequencing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventDraft {
    pub event_type: EventType,
    pub change_info: ChangeInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_transition: Option<StateTransition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl EventDraft {
    pub fn new(event_type: EventType, change_info: ChangeInfo) -> Self {
        Self {
            event_type,
            change_info,
            state_transition: None,
            payload: None,
        }
    }

    /// Shorthand for a `modified` event touching the given entities.
    pub fn modified(element_type: impl Into<String>, entity_ids: Vec<EntityId>) -> Self {
        Self::new(
            EventType::Modified,
            ChangeInfo::new(element_type, entity_ids, ChangeOperation::Modified),
        )
    }

    #[must_use]
    pub fn with_state_transition(mut self, transition: StateTransition) -> Self {
        self.state_transition = Some(transition);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A sequenced, immutable session event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    /// Strictly monotonic per session, starting at 1.
    pub seq: u64,
    pub actor: AgentId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub change_info: ChangeInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_transition: Option<StateTransition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl SessionEvent {
    /// Stamp a draft with its assigned sequence number and actor.
    #[must_use]
    pub fn from_draft(draft: EventDraft, seq: u64, actor: impl Into<AgentId>) -> Self {
        Self {
            seq,
            actor: actor.into(),
            timestamp: Utc::now(),
            event_type: draft.event_type,
            change_info: draft.change_info,
            state_transition: draft.state_transition,
            payload: draft.payload,
        }
    }

    /// The JSON payload published on the bus for this event.
    ///
    /// ```
    /// use sessionweave::event::{EventDraft, SessionEvent};
    ///
    /// let event = SessionEvent::from_draft(
    ///     EventDraft::modified("function", vec!["f1".into()]),
    ///     1,
    ///     "agent-A",
    /// );
    /// let wire = event.to_wire("s1");
    /// assert_eq!(wire["sessionId"], "s1");
    /// assert_eq!(wire["seq"], 1);
    /// assert_eq!(wire["type"], "modified");
    /// assert_eq!(wire["changeInfo"]["entityIds"][0], "f1");
    /// ```
    #[must_use]
    pub fn to_wire(&self, session_id: &str) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = value {
            map.insert("sessionId".to_string(), Value::String(session_id.into()));
            map.insert(
                "emittedAt".to_string(),
                Value::String(self.timestamp.to_rfc3339()),
            );
        }
        value
    }
}

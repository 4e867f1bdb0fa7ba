//! Agent records, classification, and task dispatch types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::AgentId;

/// What an agent does; dispatch targets a kind plus a capability set rather
/// than a concrete implementation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Parse,
    Test,
    Scm,
    Verification,
    Analysis,
    Orchestrator,
    Custom,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    Dead,
}

/// Registration metadata supplied by the host.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub kind: AgentKind,
    pub name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Higher wins under the priority-based strategy.
    #[serde(default)]
    pub priority: u8,
}

impl AgentDescriptor {
    #[must_use]
    pub fn new(id: impl Into<AgentId>, kind: AgentKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            capabilities: BTreeSet::new(),
            priority: 0,
        }
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Live registry entry for one agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRecord {
    #[serde(flatten)]
    pub descriptor: AgentDescriptor,
    pub status: AgentStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub load: u32,
    /// Task ids currently assigned; reassigned when the agent dies.
    #[serde(default)]
    pub in_flight: Vec<String>,
}

impl AgentRecord {
    #[must_use]
    pub fn new(descriptor: AgentDescriptor) -> Self {
        Self {
            descriptor,
            status: AgentStatus::Idle,
            last_heartbeat_at: Utc::now(),
            load: 0,
            in_flight: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Idle
    }
}

/// A unit of work to dispatch to some agent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: String,
    pub kind: AgentKind,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub priority: u8,
}

impl TaskSpec {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: AgentKind) -> Self {
        Self {
            id: id.into(),
            kind,
            required_capabilities: BTreeSet::new(),
            priority: 0,
        }
    }

    #[must_use]
    pub fn requiring<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// Load-balancing strategy used by `select_for_task`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    RoundRobin,
    #[default]
    LeastLoaded,
    PriorityBased,
    CapabilityWeighted,
    /// Blend of load and capability overlap.
    Dynamic,
}

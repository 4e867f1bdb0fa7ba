//! Agent registry: heartbeats, liveness, and task dispatch.

pub mod registry;
pub mod types;

pub use registry::{AgentRegistry, DEFAULT_MAX_AGENTS};
pub use types::{
    AgentDescriptor, AgentKind, AgentRecord, AgentStatus, SelectionStrategy, TaskSpec,
};

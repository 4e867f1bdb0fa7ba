//! Crate-wide error type for coordination operations.
//!
//! Every fallible operation on the facade and the storage seams returns
//! [`CoordError`]. Each variant carries a stable SCREAMING_SNAKE code (see
//! [`CoordError::code`]) which is what wire surfaces and structured logs
//! report; the Rust-side variant carries the human context.

use miette::Diagnostic;
use thiserror::Error;

/// Errors surfaced by the coordination core.
#[derive(Debug, Error, Diagnostic)]
pub enum CoordError {
    /// The session id does not resolve to a live (or grace-period) session.
    #[error("session not found: {session_id}")]
    #[diagnostic(
        code(sessionweave::session_not_found),
        help("Check the session id; sessions past their grace window are purged.")
    )]
    SessionNotFound { session_id: String },

    /// The session exists but its TTL has elapsed; writes are refused.
    #[error("session expired: {session_id}")]
    #[diagnostic(
        code(sessionweave::session_expired),
        help("Reads remain available during the grace window; create a new session to continue emitting.")
    )]
    SessionExpired { session_id: String },

    /// The emitting agent never joined the session.
    #[error("agent {agent_id} has not joined session {session_id}")]
    #[diagnostic(
        code(sessionweave::actor_not_joined),
        help("Call join_session before emitting on behalf of this agent.")
    )]
    ActorNotJoined {
        session_id: String,
        agent_id: String,
    },

    /// Observed event sequence numbers are not contiguous.
    #[error("sequence gap in session {session_id}: expected {expected}, got {got}")]
    #[diagnostic(code(sessionweave::sequence_gap))]
    SequenceGap {
        session_id: String,
        expected: u64,
        got: u64,
    },

    /// Concurrent appenders exhausted the bounded conditional-write retries.
    #[error("append contention on session {session_id} after {retries} retries")]
    #[diagnostic(code(sessionweave::contention))]
    Contention { session_id: String, retries: u32 },

    /// Input failed structural validation.
    #[error("validation failed: {message}")]
    #[diagnostic(code(sessionweave::validation))]
    Validation { message: String },

    /// The backing store is unreachable or failing; retries were exhausted.
    #[error("backend unavailable: {message}")]
    #[diagnostic(
        code(sessionweave::backend_unavailable),
        help("Transient backend errors are retried with bounded backoff before surfacing.")
    )]
    BackendUnavailable { message: String },

    /// A caller-supplied deadline elapsed.
    #[error("operation timed out after {elapsed_ms} ms")]
    #[diagnostic(code(sessionweave::timeout))]
    Timeout { elapsed_ms: u64 },

    /// A synchronous checkpoint request outlived its deadline; the job keeps
    /// running in the background.
    #[error("checkpoint job {job_id} still pending")]
    #[diagnostic(
        code(sessionweave::checkpoint_pending),
        help("The job continues in the background; watch the bus for its terminal notice.")
    )]
    CheckpointPending { job_id: String },

    /// The graph collaborator rejected or failed a checkpoint operation.
    #[error("graph collaborator failure: {message}")]
    #[diagnostic(code(sessionweave::graph_collaborator_failure))]
    GraphCollaboratorFailure { message: String },

    /// A heartbeat or dispatch referenced an unregistered agent.
    #[error("unknown agent: {agent_id}")]
    #[diagnostic(code(sessionweave::unknown_agent))]
    UnknownAgent { agent_id: String },

    /// An agent with this id is already registered.
    #[error("duplicate agent: {agent_id}")]
    #[diagnostic(code(sessionweave::duplicate_agent))]
    DuplicateAgent { agent_id: String },

    /// The pending-job ceiling was reached.
    #[error("checkpoint job queue is full ({depth} pending)")]
    #[diagnostic(code(sessionweave::queue_full))]
    QueueFull { depth: usize },

    /// The coordinator is draining; new work is refused.
    #[error("coordinator is shutting down")]
    #[diagnostic(code(sessionweave::shutting_down))]
    ShuttingDown,
}

impl CoordError {
    /// Stable machine-readable code for wire surfaces and log records.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            CoordError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            CoordError::SessionExpired { .. } => "SESSION_EXPIRED",
            CoordError::ActorNotJoined { .. } => "ACTOR_NOT_JOINED",
            CoordError::SequenceGap { .. } => "SEQUENCE_GAP",
            CoordError::Contention { .. } => "CONTENTION",
            CoordError::Validation { .. } => "VALIDATION",
            CoordError::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            CoordError::Timeout { .. } => "TIMEOUT",
            CoordError::CheckpointPending { .. } => "CHECKPOINT_PENDING",
            CoordError::GraphCollaboratorFailure { .. } => "GRAPH_COLLABORATOR_FAILURE",
            CoordError::UnknownAgent { .. } => "UNKNOWN_AGENT",
            CoordError::DuplicateAgent { .. } => "DUPLICATE_AGENT",
            CoordError::QueueFull { .. } => "QUEUE_FULL",
            CoordError::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// True when the error is transient and worth a bounded retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordError::BackendUnavailable { .. } | CoordError::Contention { .. }
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        CoordError::Validation {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        CoordError::BackendUnavailable {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            CoordError::SessionNotFound {
                session_id: "s".into()
            }
            .code(),
            "SESSION_NOT_FOUND"
        );
        assert_eq!(CoordError::ShuttingDown.code(), "SHUTTING_DOWN");
        assert_eq!(
            CoordError::CheckpointPending { job_id: "j".into() }.code(),
            "CHECKPOINT_PENDING"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(CoordError::backend("down").is_transient());
        assert!(!CoordError::ShuttingDown.is_transient());
    }
}

//! Per-session append-only, gap-checked event streams.

pub mod memory;

pub use memory::InMemoryEventLog;

use async_trait::async_trait;

use crate::errors::Result;
use crate::event::SessionEvent;

/// Default tail returned by [`EventLog::range`] when no upper bound is given.
pub const DEFAULT_RANGE_TAIL: usize = 1000;

/// Ordered storage of session events keyed by `(session_id, seq)`.
///
/// `append` persists an event whose sequence number was already reserved
/// against the session document; implementations reject out-of-order writes
/// with `SEQUENCE_GAP`. Backends with a separate counter and event write use
/// a conditional write with bounded retries (`utils::retry::conditional_append`)
/// and surface `CONTENTION` when the retries are exhausted.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Persist one sequenced event. Returns the stored sequence number.
    async fn append(&self, session_id: &str, event: SessionEvent) -> Result<u64>;

    /// Events in `seq` order, `from_seq..=to_seq`. With no upper bound the
    /// newest [`DEFAULT_RANGE_TAIL`] events from `from_seq` are returned; a
    /// hole inside the selection fails with `SEQUENCE_GAP`.
    async fn range(
        &self,
        session_id: &str,
        from_seq: u64,
        to_seq: Option<u64>,
    ) -> Result<Vec<SessionEvent>>;

    /// The newest `count` events of a session, in `seq` order.
    async fn tail(&self, session_id: &str, count: usize) -> Result<Vec<SessionEvent>>;

    /// Retain only the newest `keep_tail` events. Returns how many were
    /// discarded. Archival of trimmed events is the graph collaborator's
    /// concern, reached through checkpoints.
    async fn trim(&self, session_id: &str, keep_tail: usize) -> Result<usize>;

    /// Total events currently retained for a session.
    async fn len(&self, session_id: &str) -> Result<usize>;

    /// Drop all events of a session.
    async fn purge(&self, session_id: &str) -> Result<()>;

    /// Liveness probe of the backing store.
    async fn ping(&self) -> Result<()>;
}

//! Session documents, membership, and the store seam.

pub mod store;
pub mod types;

pub use store::{InMemorySessionStore, SessionStore};
pub use types::{AppendTicket, LeaveOutcome, SessionDocument, SessionOptions, SessionState};

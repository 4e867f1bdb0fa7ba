//! # Sessionweave: Session & Agent Coordination Core
//!
//! Sessionweave lets cooperating agents share short-lived, strictly ordered
//! streams of change events, durably materialises those streams into graph
//! checkpoints through a retrying job runner, and fans live updates out to
//! other agents and UIs.
//!
//! ## Core Concepts
//!
//! - **Sessions**: bounded collaboration contexts with TTL + grace windows
//! - **Events**: immutable, per-session records with monotonic sequence numbers
//! - **Bus**: at-least-once fan-out over named channels with pluggable sinks
//! - **Checkpoint jobs**: durable FIFO with retry, dead-letter, and hydration
//! - **Agents**: heartbeat-tracked registry with load-balanced dispatch
//!
//! ## Quick Start
//!
//! ```
//! use sessionweave::config::CoordinatorConfig;
//! use sessionweave::event::EventDraft;
//! use sessionweave::manager::SessionManager;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = SessionManager::builder(CoordinatorConfig::default())
//!     .build()
//!     .await?;
//!
//! let session_id = manager.create_session("agent-A", None).await?;
//! let seq = manager
//!     .emit_event(
//!         &session_id,
//!         EventDraft::modified("function", vec!["parse_fn".into()]),
//!         "agent-A",
//!     )
//!     .await?;
//! assert_eq!(seq, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Observing the stream
//!
//! ```no_run
//! use sessionweave::bus::{MemorySink, SessionBus};
//! use std::sync::Arc;
//!
//! let sink = MemorySink::new();
//! let bus = Arc::new(SessionBus::with_sink(sink.clone()));
//! bus.listen();
//! // Pass `bus` to SessionManager::builder(...).with_bus(bus) and every
//! // session event, handoff, and job notice lands in the sink.
//! ```
//!
//! ## Durable queues
//!
//! With the `sqlite` or `postgres` feature the checkpoint job queue mirrors
//! every transition into `checkpoint_jobs`; on restart,
//! `SessionManagerBuilder::hydrate_jobs` re-queues whatever never reached a
//! terminal state, exactly once per job id.
//!
//! ## Module Guide
//!
//! - [`manager`] - Public facade: create/join/emit/checkpoint/shutdown
//! - [`event`] - Event model and wire shapes
//! - [`bus`] - Broadcast hub, channels, sinks, subscriptions
//! - [`sessions`] - Session documents and the store seam
//! - [`log`] - Append-only, gap-checked event streams
//! - [`jobs`] - Checkpoint job queue, worker, and persistence
//! - [`agents`] - Agent registry and task dispatch
//! - [`graph`] - Graph collaborator seam
//! - [`replay`] - Record/replay of finished sessions
//! - [`health`] - Health reports and shutdown phases

pub mod agents;
pub mod backend;
pub mod bus;
pub mod config;
pub mod errors;
pub mod event;
pub mod graph;
pub mod health;
pub mod jobs;
pub mod log;
pub mod manager;
pub mod replay;
pub mod sessions;
pub mod telemetry;
pub mod utils;

pub use errors::{CoordError, Result};
pub use manager::{CheckpointOptions, SessionManager, SessionManagerBuilder};

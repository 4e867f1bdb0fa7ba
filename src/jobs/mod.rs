//! Durable checkpoint jobs: queue, worker, and persistence backends.

pub mod persistence;
pub mod queue;
pub mod types;
pub mod worker;

#[cfg(feature = "sqlite")]
pub mod store_sqlite;

#[cfg(feature = "postgres")]
pub mod store_postgres;

pub use persistence::{InMemoryJobStore, JobStore, PersistedJob, RecoveryData};
pub use queue::{CheckpointJobQueue, JobTicket, QueueConfig, QueueStats, MAX_PENDING_JOBS};
pub use types::{CheckpointJob, CheckpointRequest, CheckpointTrigger, JobOutcome, JobStatus};
pub use worker::CheckpointWorker;

#[cfg(feature = "sqlite")]
pub use store_sqlite::SqliteJobStore;

#[cfg(feature = "postgres")]
pub use store_postgres::PostgresJobStore;

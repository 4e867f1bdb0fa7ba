//! Optional durable backends for the session store and event log.

#[cfg(feature = "storage-redis")]
pub mod redis;

#[cfg(feature = "storage-redis")]
pub use redis::{RedisBackend, RedisPublishSink};

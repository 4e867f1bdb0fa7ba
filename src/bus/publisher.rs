use std::fmt;

use thiserror::Error;

use super::message::BusMessage;

/// Abstract publishing seam components hold instead of the full bus.
pub trait BusPublisher: Send + Sync + fmt::Debug {
    /// Publish a message in a synchronous, non-blocking manner.
    fn publish(&self, message: BusMessage) -> Result<(), PublishError>;
}

/// Errors that can occur when publishing to the bus.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("bus hub closed")]
    Closed,
    #[error("bus lag exceeded buffer; dropped {0} messages")]
    Lagged(usize),
    #[error("publish failed: {0}")]
    Other(String),
}

impl PublishError {
    pub fn other(error: impl Into<String>) -> Self {
        Self::Other(error.into())
    }
}

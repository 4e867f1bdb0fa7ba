//! Fan-out of coordination notices to in-process and cross-process
//! subscribers.
//!
//! The module is organised around a broadcast-based [`BusHub`] with helpers
//! for configuring sinks ([`SessionBus`]) and consuming the resulting
//! [`BusStream`].

pub mod bus;
pub mod hub;
pub mod message;
pub mod publisher;
pub mod sink;

pub use bus::{SessionBus, Subscription};
pub use hub::{BusHub, BusMetrics, BusStream};
pub use message::{BusMessage, BusPayload};
pub use publisher::{BusPublisher, PublishError};
pub use sink::{ChannelSink, JsonLinesSink, MemorySink, MessageSink, StdOutSink};

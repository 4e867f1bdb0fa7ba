//! Broadcast hub backing the coordination bus.
//!
//! One `tokio::sync::broadcast` channel fans every [`BusMessage`] out to all
//! subscribers; per-channel filtering happens on the receiving side so that
//! ordering within one channel is the ordering of the underlying broadcast.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tokio::time::timeout;

use super::message::BusMessage;
use super::publisher::PublishError;

/// Snapshot of hub health for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusMetrics {
    /// Maximum messages buffered per subscriber before lag occurs.
    pub capacity: usize,
    /// Total messages dropped due to slow subscribers.
    pub dropped: usize,
}

#[derive(Debug)]
pub struct BusHub {
    sender: RwLock<Option<Sender<BusMessage>>>,
    dropped: AtomicUsize,
    capacity: usize,
}

impl BusHub {
    /// Create a hub; `capacity` is clamped to at least 1 to satisfy the
    /// broadcast API.
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self {
            sender: RwLock::new(Some(sender)),
            dropped: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Publish a message to all subscribers.
    ///
    /// Returns [`PublishError::Closed`] once the hub has been shut down.
    pub fn publish(&self, message: BusMessage) -> Result<(), PublishError> {
        match self.current_sender() {
            Some(sender) => match sender.send(message) {
                Ok(_) => Ok(()),
                Err(broadcast::error::SendError(message)) => {
                    drop(message);
                    Err(PublishError::Closed)
                }
            },
            None => Err(PublishError::Closed),
        }
    }

    /// Subscribe to every message, regardless of channel.
    pub fn subscribe_all(self: &Arc<Self>) -> BusStream {
        self.subscribe_filtered(None)
    }

    /// Subscribe to one named channel.
    pub fn subscribe(self: &Arc<Self>, channel: impl Into<String>) -> BusStream {
        self.subscribe_filtered(Some(channel.into()))
    }

    fn subscribe_filtered(self: &Arc<Self>, channel: Option<String>) -> BusStream {
        let receiver = self
            .current_sender()
            .map(|sender| sender.subscribe())
            .unwrap_or_else(|| {
                // Already closed: hand back a receiver that reports Closed.
                let (sender, receiver) = broadcast::channel(self.capacity.max(1));
                drop(sender);
                receiver
            });
        BusStream {
            receiver,
            hub: Arc::clone(self),
            channel,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            capacity: self.capacity(),
            dropped: self.dropped(),
        }
    }

    /// Close the hub; all subscribers observe end-of-stream.
    pub fn close(&self) {
        let _ = self.sender.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    fn current_sender(&self) -> Option<Sender<BusMessage>> {
        self.sender.read().clone()
    }

    fn record_lag(&self, missed: u64) {
        if missed == 0 {
            return;
        }
        let increment = usize::try_from(missed).unwrap_or(usize::MAX);
        let total = self
            .dropped
            .fetch_add(increment, Ordering::Relaxed)
            .saturating_add(increment);
        tracing::warn!(
            target: "sessionweave::bus",
            missed,
            total_dropped = total,
            "bus stream lagged; dropped messages"
        );
    }
}

/// Receiving side of a hub subscription, optionally filtered to one channel.
#[derive(Debug)]
pub struct BusStream {
    receiver: Receiver<BusMessage>,
    hub: Arc<BusHub>,
    channel: Option<String>,
}

impl BusStream {
    /// Receive the next matching message.
    ///
    /// Lag on the underlying broadcast is recorded in hub metrics and skipped
    /// over; `None` means the hub closed.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => {
                    if self.matches(&message) {
                        return Some(message);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.hub.record_lag(missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive of the next matching message.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => {
                    if self.matches(&message) {
                        return Some(message);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.hub.record_lag(missed);
                }
                Err(_) => return None,
            }
        }
    }

    /// Receive with a deadline; `None` on timeout or closed hub.
    pub async fn next_timeout(&mut self, duration: Duration) -> Option<BusMessage> {
        match timeout(duration, self.recv()).await {
            Ok(result) => result,
            Err(_) => None,
        }
    }

    /// Adapt the subscription into a boxed stream so callers can plug it into
    /// combinators without worrying about pinning at the call site.
    pub fn into_async_stream(self) -> BoxStream<'static, BusMessage> {
        stream::unfold(self, |mut stream| async move {
            stream.recv().await.map(|message| (message, stream))
        })
        .boxed()
    }

    fn matches(&self, message: &BusMessage) -> bool {
        match &self.channel {
            Some(channel) => &message.channel == channel,
            None => true,
        }
    }
}

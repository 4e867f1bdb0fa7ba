use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::{sync::oneshot, task};

use super::hub::{BusHub, BusMetrics, BusStream};
use super::message::{BusMessage, BusPayload};
use super::publisher::{BusPublisher, PublishError};
use super::sink::{MessageSink, StdOutSink};

const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Fan-out bus for session, job, and agent notices.
///
/// `SessionBus` receives messages from the coordination core and broadcasts
/// them to per-channel subscribers and to attached sinks (stdout, channels,
/// files, monitoring systems). Delivery inside the process is at-least-once;
/// subscribers must be idempotent and can deduplicate session events by
/// `(session_id, seq)`.
///
/// Ordering is preserved per channel for a single subscriber; across channels
/// there is no ordering guarantee.
///
/// ```text
/// SessionManager / JobQueue / AgentRegistry
///     │ publish(channel, payload)
///     ▼
/// SessionBus
///     │ broadcast
///     ├─────────┬──────────┬─────────┐
///     ▼         ▼          ▼         ▼
/// subscriber  StdOut    Channel   Custom
///  handlers    Sink      Sink      Sink
/// ```
pub struct SessionBus {
    sinks: Arc<Mutex<Vec<SinkEntry>>>,
    hub: Arc<BusHub>,
    started: AtomicBool,
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl SessionBus {
    pub fn with_sink<T>(sink: T) -> Self
    where
        T: MessageSink + 'static,
    {
        Self::with_sinks(vec![Box::new(sink)])
    }

    pub fn with_sinks(sinks: Vec<Box<dyn MessageSink>>) -> Self {
        Self::with_capacity(sinks, DEFAULT_BUFFER_CAPACITY)
    }

    /// A bus with no sinks at all; useful for embedding and tests that only
    /// use subscriptions.
    pub fn bare() -> Self {
        Self::with_capacity(Vec::new(), DEFAULT_BUFFER_CAPACITY)
    }

    pub(crate) fn with_capacity(sinks: Vec<Box<dyn MessageSink>>, buffer_capacity: usize) -> Self {
        let hub = BusHub::new(buffer_capacity);
        let entries = sinks.into_iter().map(SinkEntry::new).collect();
        Self {
            sinks: Arc::new(Mutex::new(entries)),
            hub,
            started: AtomicBool::new(false),
        }
    }

    pub fn add_sink<T: MessageSink + 'static>(&self, sink: T) {
        self.add_boxed_sink(Box::new(sink));
    }

    pub fn add_boxed_sink(&self, sink: Box<dyn MessageSink>) {
        let mut sinks = self.sinks.lock().unwrap();
        let mut entry = SinkEntry::new(sink);
        if self.started.load(Ordering::SeqCst) {
            entry.spawn_worker(self.hub.clone());
        }
        sinks.push(entry);
    }

    /// Publish one payload on a named channel.
    ///
    /// Callers only publish after the event is durably appended, so anything a
    /// subscriber observes has already been committed.
    pub fn publish(
        &self,
        channel: impl Into<String>,
        payload: BusPayload,
    ) -> Result<(), PublishError> {
        self.hub.publish(BusMessage::new(channel, payload))
    }

    /// Cheap cloneable publishing handle for components.
    pub fn publisher(&self) -> Arc<dyn BusPublisher> {
        Arc::new(HubPublisher {
            hub: Arc::clone(&self.hub),
        })
    }

    /// Stream of messages on one channel.
    pub fn subscribe(&self, channel: impl Into<String>) -> BusStream {
        self.hub.subscribe(channel)
    }

    /// Stream of every message on the bus.
    pub fn subscribe_all(&self) -> BusStream {
        self.hub.subscribe_all()
    }

    /// Run `handler` for every message on `channel` until the returned guard
    /// is dropped or [`Subscription::unsubscribe`] is called.
    ///
    /// The handler runs on its own task; it must not block for long stretches
    /// (offload heavy work), but it can never stall the publish path.
    pub fn subscribe_with(
        &self,
        channel: impl Into<String>,
        handler: impl Fn(BusMessage) + Send + 'static,
    ) -> Subscription {
        let mut stream = self.subscribe(channel);
        let handle = task::spawn(async move {
            while let Some(message) = stream.recv().await {
                handler(message);
            }
        });
        Subscription {
            handle: Some(handle),
        }
    }

    pub fn metrics(&self) -> BusMetrics {
        self.hub.metrics()
    }

    /// Start sink workers. Idempotent.
    pub fn listen(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sinks = self.sinks.lock().unwrap();
        for entry in sinks.iter_mut() {
            entry.spawn_worker(self.hub.clone());
        }
    }

    /// Stop sink workers, draining buffered messages first.
    pub async fn stop_listener(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<_> = {
            let mut sinks = self.sinks.lock().unwrap();
            sinks.iter_mut().filter_map(|e| e.worker.take()).collect()
        };
        for worker in entries {
            let _ = worker.shutdown.send(());
            let _ = worker.handle.await;
        }
    }

    /// Close the hub; subscribers observe end-of-stream.
    pub fn close(&self) {
        self.hub.close();
    }

    pub fn is_closed(&self) -> bool {
        self.hub.is_closed()
    }
}

impl Drop for SessionBus {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            if let Ok(mut sinks) = self.sinks.lock() {
                for entry in sinks.iter_mut() {
                    entry.abort_worker();
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
struct HubPublisher {
    hub: Arc<BusHub>,
}

impl BusPublisher for HubPublisher {
    fn publish(&self, message: BusMessage) -> Result<(), PublishError> {
        self.hub.publish(message)
    }
}

/// Guard for a handler-based subscription; dropping it unsubscribes.
pub struct Subscription {
    handle: Option<task::JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct SinkEntry {
    sink: Arc<Mutex<Box<dyn MessageSink>>>,
    worker: Option<SinkWorker>,
}

impl SinkEntry {
    fn new(sink: Box<dyn MessageSink>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            worker: None,
        }
    }

    fn spawn_worker(&mut self, hub: Arc<BusHub>) {
        if self.worker.is_some() {
            return;
        }
        let sink = Arc::clone(&self.sink);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let mut stream = hub.subscribe_all();
        let handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    message = stream.recv() => match message {
                        Some(message) => {
                            if let Ok(mut guard) = sink.lock() {
                                if let Err(err) = guard.handle(&message) {
                                    tracing::warn!(
                                        target: "sessionweave::bus",
                                        sink = %guard.name(),
                                        error = %err,
                                        "bus sink error"
                                    );
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        self.worker = Some(SinkWorker {
            shutdown: shutdown_tx,
            handle,
        });
    }

    fn abort_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(());
            worker.handle.abort();
        }
    }
}

struct SinkWorker {
    shutdown: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

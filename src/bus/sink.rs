use std::any::type_name;
use std::fs::File;
use std::io::{self, Result as IoResult, Stdout, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex as ParkingMutex;

use super::message::BusMessage;
use crate::telemetry::{PlainFormatter, TelemetryFormatter};

/// Abstraction over an output target that consumes full bus messages.
pub trait MessageSink: Sync + Send {
    /// Handle one message. Sink decides how to serialize/format it.
    ///
    /// Implementations may perform blocking I/O; the bus runs each sink on a
    /// dedicated worker task so the publish path is never blocked.
    fn handle(&mut self, message: &BusMessage) -> IoResult<()>;

    /// A stable, human-friendly identifier for this sink instance.
    fn name(&self) -> String {
        type_name::<Self>().to_string()
    }
}

/// Stdout sink with optional formatting.
pub struct StdOutSink<F: TelemetryFormatter = PlainFormatter> {
    handle: Stdout,
    formatter: F,
}

impl Default for StdOutSink {
    fn default() -> Self {
        Self {
            handle: io::stdout(),
            formatter: PlainFormatter::new(),
        }
    }
}

impl<F: TelemetryFormatter> StdOutSink<F> {
    pub fn with_formatter(formatter: F) -> Self {
        Self {
            handle: io::stdout(),
            formatter,
        }
    }
}

impl<F: TelemetryFormatter> MessageSink for StdOutSink<F> {
    fn handle(&mut self, message: &BusMessage) -> IoResult<()> {
        let rendered = self.formatter.render_message(message).join_lines();
        self.handle.write_all(rendered.as_bytes())?;
        self.handle.flush()
    }
}

/// In-memory sink for testing and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<ParkingMutex<Vec<BusMessage>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured messages. Clones the internal buffer so
    /// callers can inspect state without holding the mutex.
    pub fn snapshot(&self) -> Vec<BusMessage> {
        self.entries.lock().clone()
    }

    /// Messages captured for one channel, in arrival order.
    pub fn on_channel(&self, channel: &str) -> Vec<BusMessage> {
        self.entries
            .lock()
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl MessageSink for MemorySink {
    fn handle(&mut self, message: &BusMessage) -> IoResult<()> {
        self.entries.lock().push(message.clone());
        Ok(())
    }
}

/// JSON Lines sink for machine-readable structured output.
///
/// One wire-shaped JSON object per line, suitable for log aggregation and
/// test assertions.
pub struct JsonLinesSink {
    handle: Box<dyn Write + Send + Sync>,
}

impl JsonLinesSink {
    pub fn new(handle: Box<dyn Write + Send + Sync>) -> Self {
        Self { handle }
    }

    pub fn to_stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Write to a file (created or truncated).
    pub fn to_file(path: impl AsRef<Path>) -> IoResult<Self> {
        let file = File::create(path)?;
        Ok(Self::new(Box::new(file)))
    }
}

impl MessageSink for JsonLinesSink {
    fn handle(&mut self, message: &BusMessage) -> IoResult<()> {
        let json = serde_json::to_string(&message.to_wire())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writeln!(self.handle, "{json}")?;
        self.handle.flush()
    }

    fn name(&self) -> String {
        "JsonLinesSink".to_string()
    }
}

/// Channel-based sink for streaming messages to async consumers.
///
/// Forwards messages into a flume channel so web handlers, dashboards, or
/// cross-process bridges can consume them off the bus thread.
pub struct ChannelSink {
    tx: flume::Sender<BusMessage>,
}

impl ChannelSink {
    pub fn new(tx: flume::Sender<BusMessage>) -> Self {
        Self { tx }
    }
}

impl MessageSink for ChannelSink {
    fn handle(&mut self, message: &BusMessage) -> IoResult<()> {
        self.tx
            .send(message.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel receiver dropped"))
    }
}

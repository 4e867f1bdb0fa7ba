//! Rendering of bus messages for human-facing sinks, plus tracing setup for
//! hosting binaries.

use crate::bus::message::{BusMessage, BusPayload};

/// Install the default tracing subscriber: env-filtered fmt output with span
/// traces captured for error reports. Safe to call more than once.
pub fn init_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .try_init();
}

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta
pub const RESET_COLOR: &str = "\x1b[0m";

/// Rendered output for one message that a sink can write.
#[derive(Clone, Debug, Default)]
pub struct MessageRender {
    pub context: Option<String>,
    pub lines: Vec<String>,
}

impl MessageRender {
    pub fn join_lines(&self) -> String {
        self.lines.join("")
    }
}

pub trait TelemetryFormatter: Send + Sync {
    fn render_message(&self, message: &BusMessage) -> MessageRender;
}

pub struct PlainFormatter;

impl PlainFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render_message(&self, message: &BusMessage) -> MessageRender {
        let summary = match &message.payload {
            BusPayload::SessionEvent { session_id, event } => format!(
                "[{session_id}@{}] {} by {} ({} {:?})",
                event.seq,
                event.event_type,
                event.actor,
                event.change_info.element_type,
                event.change_info.entity_ids,
            ),
            BusPayload::SessionCreated {
                session_id,
                agent_id,
            } => format!("session {session_id} created by {agent_id}"),
            BusPayload::SessionClosed { session_id, reason } => {
                format!("session {session_id} closed: {reason}")
            }
            BusPayload::Handoff {
                session_id,
                agent_id,
                joined,
            } => {
                let verb = if *joined { "joined" } else { "left" };
                format!("{agent_id} {verb} session {session_id}")
            }
            BusPayload::JobCompleted {
                job_id,
                checkpoint_id,
                ..
            } => format!("job {job_id} completed -> checkpoint {checkpoint_id}"),
            BusPayload::JobAttemptFailed {
                job_id,
                attempt,
                error,
                ..
            } => format!("job {job_id} attempt {attempt} failed: {error}"),
            BusPayload::JobFailed { job_id, error, .. } => {
                format!("job {job_id} failed: {error}")
            }
            BusPayload::JobDeadLettered { job_id, .. } => {
                format!("job {job_id} dead-lettered")
            }
            BusPayload::AgentDead { agent_id } => format!("agent {agent_id} is dead"),
            BusPayload::AgentHeartbeat { agent_id, at } => {
                format!("heartbeat {agent_id} @ {at}")
            }
        };
        let line = format!(
            "{CONTEXT_COLOR}{}{RESET_COLOR} {LINE_COLOR}{summary}{RESET_COLOR}\n",
            message.channel
        );
        MessageRender {
            context: Some(message.channel.clone()),
            lines: vec![line],
        }
    }
}

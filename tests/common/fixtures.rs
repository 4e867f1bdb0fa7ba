//! Shared builders for integration tests.

use std::sync::Arc;
use std::time::Duration;

use sessionweave::bus::{BusMessage, BusPayload, BusStream, SessionBus};
use sessionweave::config::CoordinatorConfig;
use sessionweave::event::EventDraft;
use sessionweave::graph::GraphCollaborator;
use sessionweave::manager::SessionManager;

/// Config tuned for fast tests: tiny retry delays, generous TTLs.
pub fn test_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.retry_delay_ms = 10;
    config.default_ttl_seconds = 0;
    config
}

/// Manager wired to a bare bus and the given collaborator.
pub async fn manager_with(
    config: CoordinatorConfig,
    graph: Arc<dyn GraphCollaborator>,
) -> (Arc<SessionManager>, Arc<SessionBus>) {
    let bus = Arc::new(SessionBus::bare());
    let manager = SessionManager::builder(config)
        .with_bus(Arc::clone(&bus))
        .with_graph(graph)
        .build()
        .await
        .expect("manager builds");
    (Arc::new(manager), bus)
}

pub fn modified(entity: &str) -> EventDraft {
    EventDraft::modified("function", vec![entity.to_string()])
}

/// Wait for the next `jobCompleted` notice, skipping everything else.
pub async fn next_job_completed(stream: &mut BusStream, timeout: Duration) -> Option<BusMessage> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let message = stream.next_timeout(remaining).await?;
        if matches!(message.payload, BusPayload::JobCompleted { .. }) {
            return Some(message);
        }
    }
}

/// Collect job-lifecycle notices by kind until `deadline` elapses quietly.
pub async fn drain_job_notices(stream: &mut BusStream, quiet: Duration) -> Vec<BusPayload> {
    let mut notices = Vec::new();
    while let Some(message) = stream.next_timeout(quiet).await {
        notices.push(message.payload);
    }
    notices
}

//! Health aggregation and graceful-shutdown types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Probe result for one dependency.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentStatus {
    pub name: String,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Aggregated health snapshot reported by the facade.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: Vec<ComponentStatus>,
    pub active_sessions: usize,
    pub queue_depth: usize,
    pub dead_letters: usize,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    #[must_use]
    pub fn component(&self, name: &str) -> Option<&ComponentStatus> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Phases of a graceful shutdown.
///
/// `initiated → draining → checkpointing → cleanup → complete`, or `forced`
/// when the grace period runs out mid-way.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPhase {
    Running,
    Initiated,
    Draining,
    Checkpointing,
    Cleanup,
    Complete,
    Forced,
}

impl ShutdownPhase {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShutdownPhase::Complete | ShutdownPhase::Forced)
    }
}

/// Summary returned by a completed shutdown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    pub final_phase: ShutdownPhase,
    /// Checkpoint jobs issued during the checkpointing phase.
    pub checkpoints_issued: usize,
    pub active_session_ids: Vec<String>,
    pub unfinished_job_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases() {
        assert!(ShutdownPhase::Complete.is_terminal());
        assert!(ShutdownPhase::Forced.is_terminal());
        assert!(!ShutdownPhase::Draining.is_terminal());
    }

    #[test]
    fn report_lookup_by_component() {
        let report = HealthReport {
            healthy: true,
            components: vec![ComponentStatus {
                name: "sessions".into(),
                healthy: true,
                latency_ms: 1,
                detail: None,
            }],
            active_sessions: 0,
            queue_depth: 0,
            dead_letters: 0,
            checked_at: Utc::now(),
        };
        assert!(report.component("sessions").is_some());
        assert!(report.component("jobs").is_none());
    }
}

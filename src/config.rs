//! Coordinator configuration.
//!
//! A closed configuration struct: every tunable the core honours is an
//! explicit field with a documented default. Hosts construct it directly,
//! through [`CoordinatorConfig::from_env`], or with the builder-style
//! `with_*` helpers, then call [`CoordinatorConfig::validate_config`] before
//! wiring up a [`SessionManager`](crate::manager::SessionManager).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{CoordError, Result};

/// Resolved channel names used on the bus.
///
/// The defaults match the documented wire surface; hosts embedding several
/// coordinators on one broker override the prefix fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelNames {
    pub global_sessions: String,
    pub agent_events: String,
    pub agent_coordination: String,
    pub agent_heartbeat: String,
    /// Per-session channels are `{session_prefix}{session_id}`.
    pub session_prefix: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            global_sessions: "global:sessions".to_string(),
            agent_events: "agent:events".to_string(),
            agent_coordination: "agent:coordination".to_string(),
            agent_heartbeat: "agent:heartbeat".to_string(),
            session_prefix: "session:".to_string(),
        }
    }
}

impl ChannelNames {
    /// Channel carrying the ordered event stream of one session.
    #[must_use]
    pub fn session(&self, session_id: &str) -> String {
        format!("{}{}", self.session_prefix, session_id)
    }
}

/// Configuration for the coordination core.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CoordinatorConfig {
    /// Session lifetime after the last activity, in seconds. `0` disables
    /// expiry entirely.
    pub default_ttl_seconds: u64,

    /// Window after expiry during which reads still succeed but writes fail.
    pub grace_ttl_seconds: u64,

    /// Retained events per session; older events are trimmed oldest-first.
    #[validate(range(min = 1))]
    pub max_events_per_session: u64,

    /// Events between automatic checkpoints; also the default seed-derivation
    /// window.
    #[validate(range(min = 1))]
    pub checkpoint_interval: u32,

    /// Checkpoint worker lanes. Jobs for one session always land on the same
    /// lane, preserving per-session FIFO order.
    #[validate(range(min = 1))]
    pub concurrency: u32,

    /// Attempt ceiling per checkpoint job before dead-lettering.
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    /// Base delay before a failed job is re-queued, in milliseconds.
    pub retry_delay_ms: u64,

    /// Doubles the retry delay per failed attempt when set.
    pub retry_backoff_exponential: bool,

    /// Heartbeat silence after which an agent is considered dead.
    pub heartbeat_timeout_ms: u64,

    /// Interval of the background stale-agent scan.
    pub stale_scan_interval_ms: u64,

    /// Capture session snapshots alongside job failures (diagnostic aid).
    pub enable_failure_snapshots: bool,

    /// Channel naming for the bus.
    pub pub_sub_channels: ChannelNames,

    /// Redis-shaped backend URL, when the `storage-redis` feature is used.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Relational backend URL for the durable job store.
    #[serde(default)]
    pub postgres_url: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 3600,
            grace_ttl_seconds: 300,
            max_events_per_session: 1000,
            checkpoint_interval: 10,
            concurrency: 1,
            max_attempts: 3,
            retry_delay_ms: 5000,
            retry_backoff_exponential: false,
            heartbeat_timeout_ms: 120_000,
            stale_scan_interval_ms: 60_000,
            enable_failure_snapshots: false,
            pub_sub_channels: ChannelNames::default(),
            redis_url: None,
            postgres_url: None,
        }
    }
}

impl CoordinatorConfig {
    /// Build a config from the process environment, falling back to defaults.
    ///
    /// Recognised variables: `SESSION_REDIS_URL`, `SESSION_PG_URL`,
    /// `SESSION_TTL` (seconds), `SESSION_CHECKPOINT_INTERVAL`.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.redis_url = std::env::var("SESSION_REDIS_URL").ok();
        config.postgres_url = std::env::var("SESSION_PG_URL").ok();
        if let Some(ttl) = std::env::var("SESSION_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.default_ttl_seconds = ttl;
        }
        if let Some(interval) = std::env::var("SESSION_CHECKPOINT_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.checkpoint_interval = interval;
        }
        config
    }

    /// Validate structural constraints, mapping failures to a typed error.
    pub fn validate_config(&self) -> Result<()> {
        self.validate().map_err(|e| CoordError::Validation {
            message: e.to_string(),
        })
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    #[must_use]
    pub fn stale_scan_interval(&self) -> Duration {
        Duration::from_millis(self.stale_scan_interval_ms)
    }

    /// Delay before re-queuing a job that has failed `attempts` times.
    #[must_use]
    pub fn retry_delay_for_attempt(&self, attempts: u32) -> Duration {
        if self.retry_backoff_exponential {
            let factor = 2u64.saturating_pow(attempts.saturating_sub(1).min(16));
            Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
        } else {
            self.retry_delay()
        }
    }

    #[must_use]
    pub fn with_ttl_seconds(mut self, ttl: u64) -> Self {
        self.default_ttl_seconds = ttl;
        self
    }

    #[must_use]
    pub fn with_checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_retry_delay_ms(mut self, ms: u64) -> Self {
        self.retry_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn with_max_events_per_session(mut self, max: u64) -> Self {
        self.max_events_per_session = max;
        self
    }
}

/// Bounds on checkpoint traversal depth.
pub const MIN_HOP_COUNT: u8 = 1;
pub const MAX_HOP_COUNT: u8 = 5;
pub const DEFAULT_HOP_COUNT: u8 = 2;

/// Clamp a requested hop count into the supported range.
#[must_use]
pub fn clamp_hop_count(requested: Option<u8>) -> u8 {
    requested
        .unwrap_or(DEFAULT_HOP_COUNT)
        .clamp(MIN_HOP_COUNT, MAX_HOP_COUNT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        CoordinatorConfig::default().validate_config().unwrap();
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = CoordinatorConfig {
            concurrency: 0,
            ..Default::default()
        };
        let err = config.validate_config().unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn hop_count_clamps_to_range() {
        assert_eq!(clamp_hop_count(None), 2);
        assert_eq!(clamp_hop_count(Some(0)), 1);
        assert_eq!(clamp_hop_count(Some(9)), 5);
        assert_eq!(clamp_hop_count(Some(3)), 3);
    }

    #[test]
    fn exponential_backoff_doubles() {
        let config = CoordinatorConfig {
            retry_delay_ms: 100,
            retry_backoff_exponential: true,
            ..Default::default()
        };
        assert_eq!(config.retry_delay_for_attempt(1).as_millis(), 100);
        assert_eq!(config.retry_delay_for_attempt(3).as_millis(), 400);
    }

    #[test]
    fn session_channel_uses_prefix() {
        let names = ChannelNames::default();
        assert_eq!(names.session("abc"), "session:abc");
    }
}

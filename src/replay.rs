//! Record and replay of finished sessions for debugging.
//!
//! A replay record captures the initial state, every event in order, and
//! periodic snapshots. Integrity is guarded by a rolling checksum folded over
//! `(seq, actor, type)`; playback refuses records whose recomputed checksum
//! disagrees with the recorded one.

use std::hash::Hasher;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{CoordError, Result};
use crate::event::{AgentId, EventType, SessionEvent};
use crate::utils::ids::IdGenerator;

/// One captured event with its originating session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecordedEvent {
    pub session_id: String,
    pub event: SessionEvent,
}

/// Snapshot of derived state at a point in the stream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReplaySnapshot {
    pub at_seq: u64,
    pub state: Value,
}

/// A complete replayable capture.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReplayRecord {
    pub replay_id: String,
    pub initial_state: Value,
    pub events: Vec<RecordedEvent>,
    pub snapshots: Vec<ReplaySnapshot>,
    pub checksum: u64,
    pub recorded_at: DateTime<Utc>,
}

impl ReplayRecord {
    /// Recompute the rolling checksum over the stored events.
    #[must_use]
    pub fn compute_checksum(&self) -> u64 {
        self.events
            .iter()
            .fold(0u64, |acc, recorded| fold_checksum(acc, &recorded.event))
    }

    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

fn fold_checksum(acc: u64, event: &SessionEvent) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(acc);
    hasher.write_u64(event.seq);
    hasher.write(event.actor.as_bytes());
    hasher.write(event.event_type.as_str().as_bytes());
    hasher.finish()
}

/// Playback filters and pacing.
#[derive(Clone, Debug, Default)]
pub struct ReplayOptions {
    /// Only deliver these event types, when set.
    pub event_types: Option<Vec<EventType>>,
    /// Only deliver events by these actors, when set.
    pub actors: Option<Vec<AgentId>>,
    /// Playback speed multiplier; `None` replays as fast as possible.
    /// `Some(2.0)` plays back at twice the recorded pace.
    pub speed: Option<f64>,
}

impl ReplayOptions {
    fn admits(&self, event: &SessionEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(actors) = &self.actors {
            if !actors.iter().any(|a| a == &event.actor) {
                return false;
            }
        }
        true
    }
}

/// Result of one playback run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub delivered: usize,
    pub filtered_out: usize,
}

/// In-memory recorder and player for session streams.
pub struct ReplayService {
    records: Mutex<FxHashMap<String, ReplayRecord>>,
    ids: IdGenerator,
}

impl Default for ReplayService {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(FxHashMap::default()),
            ids: IdGenerator::new(),
        }
    }

    /// Start a capture; returns the replay id.
    pub fn begin(&self, initial_state: Value) -> String {
        let replay_id = self.ids.replay_id();
        self.records.lock().insert(
            replay_id.clone(),
            ReplayRecord {
                replay_id: replay_id.clone(),
                initial_state,
                events: Vec::new(),
                snapshots: Vec::new(),
                checksum: 0,
                recorded_at: Utc::now(),
            },
        );
        replay_id
    }

    /// Append one event to a capture, folding it into the checksum.
    pub fn record(&self, replay_id: &str, session_id: &str, event: SessionEvent) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(replay_id)
            .ok_or_else(|| CoordError::validation(format!("unknown replay id: {replay_id}")))?;
        record.checksum = fold_checksum(record.checksum, &event);
        record.events.push(RecordedEvent {
            session_id: session_id.to_string(),
            event,
        });
        Ok(())
    }

    /// Attach a periodic snapshot of derived state.
    pub fn record_snapshot(&self, replay_id: &str, at_seq: u64, state: Value) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(replay_id)
            .ok_or_else(|| CoordError::validation(format!("unknown replay id: {replay_id}")))?;
        record.snapshots.push(ReplaySnapshot { at_seq, state });
        Ok(())
    }

    pub fn get(&self, replay_id: &str) -> Option<ReplayRecord> {
        self.records.lock().get(replay_id).cloned()
    }

    pub fn delete(&self, replay_id: &str) -> bool {
        self.records.lock().remove(replay_id).is_some()
    }

    /// Play a capture back through `apply`, honouring filters and pacing.
    ///
    /// Fails with `VALIDATION` when the record's checksum does not match its
    /// events (a corrupted or tampered capture).
    pub async fn replay<F>(
        &self,
        replay_id: &str,
        options: ReplayOptions,
        mut apply: F,
    ) -> Result<ReplayOutcome>
    where
        F: FnMut(&RecordedEvent),
    {
        let record = self
            .get(replay_id)
            .ok_or_else(|| CoordError::validation(format!("unknown replay id: {replay_id}")))?;
        if !record.is_intact() {
            return Err(CoordError::validation(format!(
                "replay {replay_id} failed integrity check"
            )));
        }

        let mut delivered = 0;
        let mut filtered_out = 0;
        let mut previous_ts: Option<DateTime<Utc>> = None;
        for recorded in &record.events {
            if !options.admits(&recorded.event) {
                filtered_out += 1;
                continue;
            }
            if let (Some(speed), Some(prev)) = (options.speed, previous_ts) {
                if speed > 0.0 {
                    let gap = (recorded.event.timestamp - prev)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    let scaled = gap.div_f64(speed).min(Duration::from_secs(1));
                    if !scaled.is_zero() {
                        tokio::time::sleep(scaled).await;
                    }
                }
            }
            previous_ts = Some(recorded.event.timestamp);
            apply(recorded);
            delivered += 1;
        }
        Ok(ReplayOutcome {
            delivered,
            filtered_out,
        })
    }
}

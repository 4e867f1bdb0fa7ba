//! In-memory event log.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{EventLog, DEFAULT_RANGE_TAIL};
use crate::errors::{CoordError, Result};
use crate::event::SessionEvent;

/// Volatile event log keeping an ordered map of events per session.
///
/// Appends exceeding `max_events_per_session` trim the oldest events first,
/// so the retained window is always the newest `max_events_per_session`.
pub struct InMemoryEventLog {
    inner: Mutex<FxHashMap<String, BTreeMap<u64, SessionEvent>>>,
    max_events_per_session: usize,
}

impl InMemoryEventLog {
    #[must_use]
    pub fn new(max_events_per_session: usize) -> Self {
        Self {
            inner: Mutex::new(FxHashMap::default()),
            max_events_per_session: max_events_per_session.max(1),
        }
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, session_id: &str, event: SessionEvent) -> Result<u64> {
        let mut map = self.inner.lock();
        let stream = map.entry(session_id.to_string()).or_default();
        if let Some((&last, _)) = stream.iter().next_back() {
            if event.seq != last + 1 {
                return Err(CoordError::SequenceGap {
                    session_id: session_id.to_string(),
                    expected: last + 1,
                    got: event.seq,
                });
            }
        }
        let seq = event.seq;
        stream.insert(seq, event);
        while stream.len() > self.max_events_per_session {
            let oldest = *stream.keys().next().expect("non-empty stream");
            stream.remove(&oldest);
        }
        Ok(seq)
    }

    async fn range(
        &self,
        session_id: &str,
        from_seq: u64,
        to_seq: Option<u64>,
    ) -> Result<Vec<SessionEvent>> {
        let map = self.inner.lock();
        // A session with no retained events reads as an empty slice.
        let stream = match map.get(session_id) {
            Some(stream) => stream,
            None => return Ok(Vec::new()),
        };
        let upper = to_seq.unwrap_or(u64::MAX);
        let mut events: Vec<SessionEvent> = stream
            .range(from_seq..=upper)
            .map(|(_, e)| e.clone())
            .collect();
        if to_seq.is_none() && events.len() > DEFAULT_RANGE_TAIL {
            events = events.split_off(events.len() - DEFAULT_RANGE_TAIL);
        }
        for pair in events.windows(2) {
            if pair[1].seq != pair[0].seq + 1 {
                return Err(CoordError::SequenceGap {
                    session_id: session_id.to_string(),
                    expected: pair[0].seq + 1,
                    got: pair[1].seq,
                });
            }
        }
        Ok(events)
    }

    async fn tail(&self, session_id: &str, count: usize) -> Result<Vec<SessionEvent>> {
        let map = self.inner.lock();
        let stream = match map.get(session_id) {
            Some(stream) => stream,
            None => return Ok(Vec::new()),
        };
        let skip = stream.len().saturating_sub(count);
        Ok(stream.values().skip(skip).cloned().collect())
    }

    async fn trim(&self, session_id: &str, keep_tail: usize) -> Result<usize> {
        let mut map = self.inner.lock();
        let stream = match map.get_mut(session_id) {
            Some(stream) => stream,
            None => return Ok(0),
        };
        let mut discarded = 0;
        while stream.len() > keep_tail {
            let oldest = *stream.keys().next().expect("non-empty stream");
            stream.remove(&oldest);
            discarded += 1;
        }
        Ok(discarded)
    }

    async fn len(&self, session_id: &str) -> Result<usize> {
        let map = self.inner.lock();
        Ok(map.get(session_id).map_or(0, BTreeMap::len))
    }

    async fn purge(&self, session_id: &str) -> Result<()> {
        self.inner.lock().remove(session_id);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

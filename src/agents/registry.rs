//! Heartbeat-tracked registry of live agents with load-balanced dispatch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::instrument;

use super::types::{
    AgentDescriptor, AgentKind, AgentRecord, AgentStatus, SelectionStrategy, TaskSpec,
};
use crate::bus::{BusMessage, BusPayload, BusPublisher};
use crate::errors::{CoordError, Result};
use crate::event::AgentId;

/// Default ceiling on registered agents.
pub const DEFAULT_MAX_AGENTS: usize = 256;

/// Registry of cooperating agents.
///
/// Tracks heartbeats, marks silent agents dead, and picks agents for tasks
/// under a configurable load-balancing strategy. Dead agents' in-flight tasks
/// move to a reassignment pool and an `agentDead` notice goes out on the bus.
pub struct AgentRegistry {
    agents: RwLock<FxHashMap<AgentId, AgentRecord>>,
    reassignable: Mutex<Vec<String>>,
    round_robin_cursor: Mutex<usize>,
    publisher: Arc<dyn BusPublisher>,
    events_channel: String,
    heartbeat_channel: String,
    heartbeat_timeout: Duration,
    strategy: RwLock<SelectionStrategy>,
    max_agents: usize,
}

impl AgentRegistry {
    #[must_use]
    pub fn new(
        publisher: Arc<dyn BusPublisher>,
        events_channel: impl Into<String>,
        heartbeat_channel: impl Into<String>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            agents: RwLock::new(FxHashMap::default()),
            reassignable: Mutex::new(Vec::new()),
            round_robin_cursor: Mutex::new(0),
            publisher,
            events_channel: events_channel.into(),
            heartbeat_channel: heartbeat_channel.into(),
            heartbeat_timeout,
            strategy: RwLock::new(SelectionStrategy::default()),
            max_agents: DEFAULT_MAX_AGENTS,
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, max_agents: usize) -> Self {
        self.max_agents = max_agents.max(1);
        self
    }

    #[must_use]
    pub fn with_strategy(self, strategy: SelectionStrategy) -> Self {
        *self.strategy.write() = strategy;
        self
    }

    pub fn set_strategy(&self, strategy: SelectionStrategy) {
        *self.strategy.write() = strategy;
    }

    /// Register an agent. Rejects duplicate ids, empty metadata, and
    /// registrations past the capacity ceiling.
    #[instrument(skip(self, descriptor), fields(agent_id = %descriptor.id), err)]
    pub fn register(&self, descriptor: AgentDescriptor) -> Result<()> {
        if descriptor.id.is_empty() || descriptor.name.is_empty() {
            return Err(CoordError::validation("agent id and name must be non-empty"));
        }
        let mut agents = self.agents.write();
        if agents.contains_key(&descriptor.id) {
            return Err(CoordError::DuplicateAgent {
                agent_id: descriptor.id,
            });
        }
        if agents.len() >= self.max_agents {
            return Err(CoordError::validation(format!(
                "agent registry is full ({} agents)",
                agents.len()
            )));
        }
        agents.insert(descriptor.id.clone(), AgentRecord::new(descriptor));
        Ok(())
    }

    /// Remove an agent entirely; its in-flight tasks become reassignable.
    pub fn deregister(&self, agent_id: &str) -> Result<()> {
        let record = self
            .agents
            .write()
            .remove(agent_id)
            .ok_or_else(|| CoordError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;
        self.reassignable.lock().extend(record.in_flight);
        Ok(())
    }

    /// Record a heartbeat. A dead agent that reports back becomes idle again.
    pub fn heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> Result<()> {
        {
            let mut agents = self.agents.write();
            let record = agents
                .get_mut(agent_id)
                .ok_or_else(|| CoordError::UnknownAgent {
                    agent_id: agent_id.to_string(),
                })?;
            record.last_heartbeat_at = at;
            if record.status == AgentStatus::Dead {
                record.status = AgentStatus::Idle;
            }
        }
        let _ = self.publisher.publish(BusMessage::new(
            self.heartbeat_channel.clone(),
            BusPayload::AgentHeartbeat {
                agent_id: agent_id.to_string(),
                at,
            },
        ));
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Up to `count` idle agents of the given kind, in registration-stable
    /// (id) order.
    pub fn find_available(&self, kind: AgentKind, count: usize) -> Vec<AgentId> {
        let agents = self.agents.read();
        let mut available: Vec<&AgentRecord> = agents
            .values()
            .filter(|record| record.descriptor.kind == kind && record.is_available())
            .collect();
        available.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        available
            .into_iter()
            .take(count)
            .map(|record| record.descriptor.id.clone())
            .collect()
    }

    /// Pick an agent for a task under the configured strategy. Only live,
    /// capability-compatible agents of the task's kind are considered.
    pub fn select_for_task(&self, task: &TaskSpec) -> Option<AgentId> {
        let strategy = *self.strategy.read();
        let agents = self.agents.read();
        let mut candidates: Vec<&AgentRecord> = agents
            .values()
            .filter(|record| {
                record.descriptor.kind == task.kind
                    && record.status != AgentStatus::Dead
                    && record.status != AgentStatus::Stopped
                    && task
                        .required_capabilities
                        .iter()
                        .all(|c| record.descriptor.capabilities.contains(c))
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));

        let chosen = match strategy {
            SelectionStrategy::RoundRobin => {
                let mut cursor = self.round_robin_cursor.lock();
                let index = *cursor % candidates.len();
                *cursor = cursor.wrapping_add(1);
                candidates[index]
            }
            SelectionStrategy::LeastLoaded => candidates
                .iter()
                .min_by_key(|record| record.load)
                .copied()?,
            SelectionStrategy::PriorityBased => candidates
                .iter()
                .max_by_key(|record| record.descriptor.priority)
                .copied()?,
            SelectionStrategy::CapabilityWeighted => candidates
                .iter()
                .max_by_key(|record| capability_overlap(record, task))
                .copied()?,
            SelectionStrategy::Dynamic => candidates
                .iter()
                .max_by_key(|record| {
                    // Overlap pulls toward specialists, load pushes away from
                    // busy agents.
                    let overlap = capability_overlap(record, task) as i64;
                    overlap * 4 + i64::from(record.descriptor.priority) - i64::from(record.load) * 2
                })
                .copied()?,
        };
        Some(chosen.descriptor.id.clone())
    }

    /// Record that a task was handed to an agent.
    pub fn assign_task(&self, agent_id: &str, task_id: impl Into<String>) -> Result<()> {
        let mut agents = self.agents.write();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;
        record.load += 1;
        record.status = AgentStatus::Running;
        record.in_flight.push(task_id.into());
        Ok(())
    }

    /// Record that an agent finished (or abandoned) a task.
    pub fn complete_task(&self, agent_id: &str, task_id: &str) -> Result<()> {
        let mut agents = self.agents.write();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;
        record.in_flight.retain(|id| id != task_id);
        record.load = record.load.saturating_sub(1);
        if record.load == 0 && record.status == AgentStatus::Running {
            record.status = AgentStatus::Idle;
        }
        Ok(())
    }

    /// Mark agents silent past the heartbeat timeout as dead.
    ///
    /// Their in-flight tasks move to the reassignment pool and an `agentDead`
    /// notice is published per victim. Returns the ids marked dead.
    #[instrument(skip(self))]
    pub fn scan_stale(&self, now: DateTime<Utc>) -> Vec<AgentId> {
        let timeout =
            chrono::Duration::milliseconds(self.heartbeat_timeout.as_millis() as i64);
        let mut newly_dead = Vec::new();
        {
            let mut agents = self.agents.write();
            let mut reassignable = self.reassignable.lock();
            for record in agents.values_mut() {
                if record.status == AgentStatus::Dead {
                    continue;
                }
                if now - record.last_heartbeat_at > timeout {
                    record.status = AgentStatus::Dead;
                    reassignable.append(&mut record.in_flight);
                    record.load = 0;
                    newly_dead.push(record.descriptor.id.clone());
                }
            }
        }
        for agent_id in &newly_dead {
            tracing::warn!(
                target: "sessionweave::agents",
                agent_id = %agent_id,
                "agent missed heartbeat window; marked dead"
            );
            let _ = self.publisher.publish(BusMessage::new(
                self.events_channel.clone(),
                BusPayload::AgentDead {
                    agent_id: agent_id.clone(),
                },
            ));
        }
        newly_dead
    }

    /// Drain tasks orphaned by dead or deregistered agents.
    pub fn take_reassignable_tasks(&self) -> Vec<String> {
        std::mem::take(&mut *self.reassignable.lock())
    }

    /// Background stale scan on a fixed interval. Abort the handle to stop.
    pub fn spawn_stale_scanner(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.scan_stale(Utc::now());
            }
        })
    }
}

fn capability_overlap(record: &AgentRecord, task: &TaskSpec) -> usize {
    record
        .descriptor
        .capabilities
        .intersection(&task.required_capabilities)
        .count()
}

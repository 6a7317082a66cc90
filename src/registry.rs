//! Agent registry
//!
//! Authoritative mapping from agent id to connection state: declared
//! capabilities, liveness, load, and the bounded outbound channel. All
//! `in_flight` and status mutations go through the registry so the dispatcher
//! can never double-book an agent: candidate selection reads a snapshot, the
//! assignment itself re-validates under the agent's entry lock.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain_types::{ActionName, AgentId, AgentStatus, MaxInFlight, ReassignmentGraceMs};
use crate::events::{Component, EventDraft, EventLog, EventType};
use crate::protocol::{Envelope, HeartbeatStatus};

/// Agent registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent id already registered and live: {agent_id}")]
    AgentIdConflict { agent_id: AgentId },

    #[error("agent not found: {agent_id}")]
    AgentNotFound { agent_id: AgentId },

    #[error("agent unavailable: {agent_id} is {status:?}")]
    AgentUnavailable {
        agent_id: AgentId,
        status: AgentStatus,
    },

    #[error("outbound queue full for agent: {agent_id}")]
    OutboundFull { agent_id: AgentId },
}

/// Registration handshake payload
#[derive(Debug, Clone)]
pub struct Registration {
    pub agent_id: AgentId,
    pub capabilities: Vec<ActionName>,
    pub max_in_flight: Option<MaxInFlight>,
}

/// Public view of one registered agent
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub capabilities: Vec<ActionName>,
    pub in_flight: u32,
    pub max_in_flight: Option<MaxInFlight>,
}

struct AgentEntry {
    status: AgentStatus,
    capabilities: HashSet<ActionName>,
    in_flight: u32,
    max_in_flight: Option<MaxInFlight>,
    /// Registry-wide dispatch sequence at the agent's last assignment
    last_dispatched: u64,
    last_traffic: Instant,
    awaiting_pong: bool,
    outbound: mpsc::Sender<Envelope>,
    /// Connection epoch; guards grace-period removal against a reconnect
    epoch: u64,
}

impl AgentEntry {
    fn has_capacity(&self) -> bool {
        match self.max_in_flight {
            Some(cap) => self.in_flight < cap.as_u32(),
            None => true,
        }
    }
}

/// The authoritative agent map
pub struct Registry {
    agents: DashMap<AgentId, AgentEntry>,
    capabilities: DashMap<ActionName, HashSet<AgentId>>,
    dispatch_seq: AtomicU64,
    epoch_seq: AtomicU64,
    changed: watch::Sender<u64>,
    events: Arc<EventLog>,
    grace: ReassignmentGraceMs,
    weak_self: std::sync::Weak<Registry>,
}

impl Registry {
    #[must_use]
    pub fn new(events: Arc<EventLog>, grace: ReassignmentGraceMs) -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        Arc::new_cyclic(|weak_self| Self {
            agents: DashMap::new(),
            capabilities: DashMap::new(),
            // zero is reserved for "never dispatched", the strongest claim to
            // the least-recently-dispatched tie-break
            dispatch_seq: AtomicU64::new(1),
            epoch_seq: AtomicU64::new(0),
            changed,
            events,
            grace,
            weak_self: weak_self.clone(),
        })
    }

    /// Observer for registry changes; parked dispatchers wait on this
    #[must_use]
    pub fn changed(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn notify_change(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Stores a freshly handshaken agent as `ready` with no load
    ///
    /// # Errors
    /// Returns `RegistryError::AgentIdConflict` if the id is already held by
    /// a live connection. A `disconnected` entry still inside its grace
    /// period is replaced.
    pub fn register(
        &self,
        registration: Registration,
        outbound: mpsc::Sender<Envelope>,
    ) -> Result<(), RegistryError> {
        let Registration {
            agent_id,
            capabilities,
            max_in_flight,
        } = registration;

        let epoch = self.epoch_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let fresh = AgentEntry {
            status: AgentStatus::Ready,
            capabilities: capabilities.iter().cloned().collect(),
            in_flight: 0,
            max_in_flight,
            last_dispatched: 0,
            last_traffic: Instant::now(),
            awaiting_pong: false,
            outbound,
            epoch,
        };
        let replaced_caps = match self.agents.entry(agent_id.clone()) {
            MapEntry::Occupied(mut existing) => {
                if existing.get().status != AgentStatus::Disconnected {
                    return Err(RegistryError::AgentIdConflict { agent_id });
                }
                let old = existing.insert(fresh);
                Some(old.capabilities.into_iter().collect::<Vec<_>>())
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                None
            }
        };
        if let Some(old_caps) = replaced_caps {
            self.unindex(&agent_id, &old_caps);
        }

        for action in &capabilities {
            self.capabilities
                .entry(action.clone())
                .or_default()
                .insert(agent_id.clone());
        }

        info!(agent = %agent_id, capabilities = capabilities.len(), "agent registered");
        self.events.append(
            EventDraft::new(Component::Registry, EventType::AgentRegistered)
                .agent(agent_id)
                .field(
                    "capabilities",
                    capabilities
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>(),
                ),
        );
        self.notify_change();
        Ok(())
    }

    /// Replaces a live agent's declared capability list
    ///
    /// # Errors
    /// Returns `RegistryError::AgentNotFound` for an unknown or dead agent.
    pub fn update_capabilities(
        &self,
        agent_id: &AgentId,
        capabilities: Vec<ActionName>,
        max_in_flight: Option<MaxInFlight>,
    ) -> Result<(), RegistryError> {
        let removed: Vec<ActionName> = {
            let mut entry =
                self.agents
                    .get_mut(agent_id)
                    .ok_or_else(|| RegistryError::AgentNotFound {
                        agent_id: agent_id.clone(),
                    })?;
            if !entry.status.is_reachable() {
                return Err(RegistryError::AgentUnavailable {
                    agent_id: agent_id.clone(),
                    status: entry.status,
                });
            }
            let new: HashSet<ActionName> = capabilities.iter().cloned().collect();
            let removed = entry.capabilities.difference(&new).cloned().collect();
            entry.capabilities = new;
            entry.max_in_flight = max_in_flight;
            entry.last_traffic = Instant::now();
            removed
        };

        self.unindex(agent_id, &removed);
        for action in &capabilities {
            self.capabilities
                .entry(action.clone())
                .or_default()
                .insert(agent_id.clone());
        }

        self.events.append(
            EventDraft::new(Component::Registry, EventType::AgentCapabilitiesUpdated)
                .agent(agent_id.clone())
                .field(
                    "capabilities",
                    capabilities
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>(),
                ),
        );
        self.notify_change();
        Ok(())
    }

    /// Records a heartbeat and applies any carried status update
    pub fn heartbeat(&self, agent_id: &AgentId, status: Option<HeartbeatStatus>) {
        let mut draining_started = false;
        let mut status_changed = false;
        if let Some(mut entry) = self.agents.get_mut(agent_id) {
            entry.last_traffic = Instant::now();
            entry.awaiting_pong = false;
            match status {
                Some(HeartbeatStatus::Draining) if entry.status.accepts_dispatch() => {
                    entry.status = AgentStatus::Draining;
                    draining_started = true;
                    status_changed = true;
                }
                Some(HeartbeatStatus::Ready) if entry.status == AgentStatus::Draining => {
                    entry.status = if entry.in_flight > 0 {
                        AgentStatus::Busy
                    } else {
                        AgentStatus::Ready
                    };
                    status_changed = true;
                }
                _ => {}
            }
        }
        if draining_started {
            self.events.append(
                EventDraft::new(Component::Registry, EventType::AgentDraining)
                    .agent(agent_id.clone()),
            );
        }
        if status_changed {
            self.notify_change();
        }
    }

    /// Updates the liveness clock on any inbound traffic
    pub fn mark_traffic(&self, agent_id: &AgentId) {
        if let Some(mut entry) = self.agents.get_mut(agent_id) {
            entry.last_traffic = Instant::now();
            entry.awaiting_pong = false;
        }
    }

    /// Liveness snapshot for the transport watchdog
    #[must_use]
    pub fn liveness(&self, agent_id: &AgentId) -> Option<(Instant, bool)> {
        self.agents
            .get(agent_id)
            .map(|entry| (entry.last_traffic, entry.awaiting_pong))
    }

    /// Records that a liveness ping was sent and awaits a reply
    pub fn mark_pinged(&self, agent_id: &AgentId) {
        if let Some(mut entry) = self.agents.get_mut(agent_id) {
            entry.awaiting_pong = true;
        }
    }

    /// Atomically selects and books an agent for one dispatch
    ///
    /// Candidates are the ready/busy agents declaring `action`, with queue
    /// space and spare declared capacity; the pick is the smallest
    /// `in_flight`, ties broken by least-recently-dispatched. The booking
    /// re-validates under the entry lock, so two dispatchers cannot exceed an
    /// agent's capacity together.
    #[must_use]
    pub fn try_assign(&self, action: &ActionName) -> Option<AgentId> {
        let candidate_ids: Vec<AgentId> = self
            .capabilities
            .get(action)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut ranked: Vec<(u32, u64, AgentId)> = Vec::new();
        for agent_id in candidate_ids {
            if let Some(entry) = self.agents.get(&agent_id) {
                if entry.status.accepts_dispatch()
                    && entry.has_capacity()
                    && entry.capabilities.contains(action)
                    && entry.outbound.capacity() > 0
                {
                    ranked.push((entry.in_flight, entry.last_dispatched, agent_id.clone()));
                }
            }
        }
        // smallest in-flight, then least-recently-dispatched, then stable by id
        ranked.sort();

        for (_, _, agent_id) in ranked {
            if let Some(mut entry) = self.agents.get_mut(&agent_id) {
                if entry.status.accepts_dispatch() && entry.has_capacity() {
                    entry.in_flight += 1;
                    entry.status = AgentStatus::Busy;
                    entry.last_dispatched = self.dispatch_seq.fetch_add(1, Ordering::SeqCst);
                    return Some(agent_id);
                }
            }
        }
        None
    }

    /// Releases one booked slot after a dispatch resolves
    pub fn release(&self, agent_id: &AgentId) {
        if let Some(mut entry) = self.agents.get_mut(agent_id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            if entry.in_flight == 0 && entry.status == AgentStatus::Busy {
                entry.status = AgentStatus::Ready;
            }
        }
        self.notify_change();
    }

    /// Enqueues an envelope on the agent's bounded outbound channel
    ///
    /// # Errors
    /// Returns `AgentUnavailable` for dead agents and `OutboundFull` when
    /// back-pressure bites; the caller treats both as temporary
    /// unavailability.
    pub fn send(&self, agent_id: &AgentId, envelope: Envelope) -> Result<(), RegistryError> {
        let sender = {
            let entry = self
                .agents
                .get(agent_id)
                .ok_or_else(|| RegistryError::AgentNotFound {
                    agent_id: agent_id.clone(),
                })?;
            if !entry.status.is_reachable() {
                return Err(RegistryError::AgentUnavailable {
                    agent_id: agent_id.clone(),
                    status: entry.status,
                });
            }
            entry.outbound.clone()
        };

        sender.try_send(envelope).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => RegistryError::OutboundFull {
                agent_id: agent_id.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => RegistryError::AgentUnavailable {
                agent_id: agent_id.clone(),
                status: AgentStatus::Disconnected,
            },
        })
    }

    /// Marks an agent disconnected and schedules its removal after the grace
    /// period
    ///
    /// Returns false if the agent was unknown or already disconnected. The
    /// caller is responsible for reassigning the agent's in-flight tasks.
    pub fn disconnect(&self, agent_id: &AgentId, reason: &str) -> bool {
        let epoch = {
            let Some(mut entry) = self.agents.get_mut(agent_id) else {
                return false;
            };
            if entry.status == AgentStatus::Disconnected {
                return false;
            }
            entry.status = AgentStatus::Disconnected;
            entry.epoch
        };

        warn!(agent = %agent_id, reason, "agent disconnected");
        self.events.append(
            EventDraft::new(Component::Registry, EventType::AgentDisconnected)
                .agent(agent_id.clone())
                .field("reason", reason),
        );
        self.notify_change();

        let weak = self.weak_self.clone();
        let agent_id = agent_id.clone();
        let grace = self.grace.as_duration();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = weak.upgrade() {
                registry.remove_if_stale(&agent_id, epoch);
            }
        });
        true
    }

    fn remove_if_stale(&self, agent_id: &AgentId, epoch: u64) {
        let remove = self
            .agents
            .get(agent_id)
            .is_some_and(|entry| entry.status == AgentStatus::Disconnected && entry.epoch == epoch);
        if remove {
            if let Some((_, entry)) = self.agents.remove(agent_id) {
                let caps: Vec<ActionName> = entry.capabilities.into_iter().collect();
                self.unindex(agent_id, &caps);
                debug!(agent = %agent_id, "disconnected agent registration discarded");
            }
        }
    }

    fn unindex(&self, agent_id: &AgentId, actions: &[ActionName]) {
        for action in actions {
            if let Some(mut set) = self.capabilities.get_mut(action) {
                set.remove(agent_id);
                if set.is_empty() {
                    drop(set);
                    self.capabilities.remove(action);
                }
            }
        }
    }

    /// Ready/busy agents declaring `action`
    #[must_use]
    pub fn agents_with(&self, action: &ActionName) -> Vec<AgentId> {
        let ids: Vec<AgentId> = self
            .capabilities
            .get(action)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.into_iter()
            .filter(|id| {
                self.agents
                    .get(id)
                    .is_some_and(|entry| entry.status.accepts_dispatch())
            })
            .collect()
    }

    /// Snapshot of one agent for the status surface
    #[must_use]
    pub fn snapshot(&self, agent_id: &AgentId) -> Option<AgentSnapshot> {
        self.agents.get(agent_id).map(|entry| AgentSnapshot {
            agent_id: agent_id.clone(),
            status: entry.status,
            capabilities: entry.capabilities.iter().cloned().collect(),
            in_flight: entry.in_flight,
            max_in_flight: entry.max_in_flight,
        })
    }

    /// Snapshot of every known agent
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<AgentSnapshot> {
        self.agents
            .iter()
            .map(|entry| AgentSnapshot {
                agent_id: entry.key().clone(),
                status: entry.status,
                capabilities: entry.capabilities.iter().cloned().collect(),
                in_flight: entry.in_flight,
                max_in_flight: entry.max_in_flight,
            })
            .collect()
    }

    /// Current `in_flight` for one agent, for invariant checks
    #[must_use]
    pub fn in_flight(&self, agent_id: &AgentId) -> Option<u32> {
        self.agents.get(agent_id).map(|entry| entry.in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(name: &str) -> ActionName {
        ActionName::try_new(name.to_string()).unwrap()
    }

    fn agent(name: &str) -> AgentId {
        AgentId::try_new(name.to_string()).unwrap()
    }

    fn registry() -> Arc<Registry> {
        Registry::new(
            Arc::new(EventLog::new()),
            ReassignmentGraceMs::try_new(50).unwrap(),
        )
    }

    fn register(reg: &Registry, name: &str, caps: &[&str]) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(8);
        reg.register(
            Registration {
                agent_id: agent(name),
                capabilities: caps.iter().map(|c| action(c)).collect(),
                max_in_flight: None,
            },
            tx,
        )
        .unwrap();
        rx
    }

    #[tokio::test]
    async fn duplicate_live_registration_conflicts() {
        let reg = registry();
        let _rx = register(&reg, "planner-1", &["plan_research"]);

        let (tx, _rx2) = mpsc::channel(8);
        let result = reg.register(
            Registration {
                agent_id: agent("planner-1"),
                capabilities: vec![action("plan_research")],
                max_in_flight: None,
            },
            tx,
        );
        assert!(matches!(
            result,
            Err(RegistryError::AgentIdConflict { .. })
        ));
    }

    #[tokio::test]
    async fn assignment_prefers_least_loaded_then_least_recent() {
        let reg = registry();
        let _rx_a = register(&reg, "a", &["analyze"]);
        let _rx_b = register(&reg, "b", &["analyze"]);

        // both idle: first pick books one, second pick must book the other
        let first = reg.try_assign(&action("analyze")).unwrap();
        let second = reg.try_assign(&action("analyze")).unwrap();
        assert_ne!(first, second);

        // release both; the least-recently-dispatched one wins the next pick
        reg.release(&first);
        reg.release(&second);
        let third = reg.try_assign(&action("analyze")).unwrap();
        assert_eq!(third, first);
    }

    #[tokio::test]
    async fn declared_cap_bounds_assignment() {
        let reg = registry();
        let (tx, _rx) = mpsc::channel(8);
        reg.register(
            Registration {
                agent_id: agent("capped"),
                capabilities: vec![action("summarize")],
                max_in_flight: Some(MaxInFlight::try_new(1).unwrap()),
            },
            tx,
        )
        .unwrap();

        assert!(reg.try_assign(&action("summarize")).is_some());
        assert!(reg.try_assign(&action("summarize")).is_none());
        reg.release(&agent("capped"));
        assert!(reg.try_assign(&action("summarize")).is_some());
    }

    #[tokio::test]
    async fn draining_agent_is_not_assignable() {
        let reg = registry();
        let _rx = register(&reg, "drainer", &["plan"]);
        reg.heartbeat(&agent("drainer"), Some(HeartbeatStatus::Draining));
        assert!(reg.try_assign(&action("plan")).is_none());
        assert!(reg.agents_with(&action("plan")).is_empty());

        // but still reachable for cancels
        assert!(reg.send(&agent("drainer"), Envelope::Ping {
            id: crate::domain_types::EnvelopeId::generate(),
        })
        .is_ok());
    }

    #[tokio::test]
    async fn full_outbound_queue_blocks_assignment() {
        let reg = registry();
        let (tx, _rx) = mpsc::channel(1);
        reg.register(
            Registration {
                agent_id: agent("slow"),
                capabilities: vec![action("plan")],
                max_in_flight: None,
            },
            tx.clone(),
        )
        .unwrap();

        tx.try_send(Envelope::Ping {
            id: crate::domain_types::EnvelopeId::generate(),
        })
        .unwrap();
        assert!(reg.try_assign(&action("plan")).is_none());
    }

    #[tokio::test]
    async fn release_returns_agent_to_ready() {
        let reg = registry();
        let _rx = register(&reg, "worker", &["plan"]);
        let id = reg.try_assign(&action("plan")).unwrap();
        assert_eq!(reg.snapshot(&id).unwrap().status, AgentStatus::Busy);
        assert_eq!(reg.in_flight(&id), Some(1));

        reg.release(&id);
        assert_eq!(reg.snapshot(&id).unwrap().status, AgentStatus::Ready);
        assert_eq!(reg.in_flight(&id), Some(0));
    }

    #[tokio::test]
    async fn disconnected_agent_can_reregister_within_grace() {
        let reg = registry();
        let _rx = register(&reg, "flaky", &["plan"]);
        assert!(reg.disconnect(&agent("flaky"), "test"));

        let (tx, _rx2) = mpsc::channel(8);
        let result = reg.register(
            Registration {
                agent_id: agent("flaky"),
                capabilities: vec![action("plan"), action("analyze")],
                max_in_flight: None,
            },
            tx,
        );
        assert!(result.is_ok());
        assert!(reg.try_assign(&action("analyze")).is_some());
    }

    #[tokio::test]
    async fn grace_period_discards_stale_registration() {
        let reg = registry();
        let _rx = register(&reg, "gone", &["plan"]);
        assert!(reg.disconnect(&agent("gone"), "test"));

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert!(reg.snapshot(&agent("gone")).is_none());
        assert!(reg.try_assign(&action("plan")).is_none());
    }

    #[tokio::test]
    async fn capability_expansion_is_indexed() {
        let reg = registry();
        let _rx = register(&reg, "learner", &["plan"]);
        reg.update_capabilities(
            &agent("learner"),
            vec![action("plan"), action("critique")],
            None,
        )
        .unwrap();
        assert_eq!(reg.agents_with(&action("critique")).len(), 1);

        // narrowing removes the stale index entry
        reg.update_capabilities(&agent("learner"), vec![action("critique")], None)
            .unwrap();
        assert!(reg.agents_with(&action("plan")).is_empty());
    }
}

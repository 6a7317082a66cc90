//! Append-only structured event log
//!
//! The event stream is the hub's observable contract: every state transition
//! appends exactly one event, the log is total-ordered per hub, and all
//! consumers (submission API streaming, operators, external sinks) read the
//! same sequence. No free-form string is the sole source of truth for any
//! state; `replay` folds a stream back into the final task-state table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

use crate::domain_types::{AgentId, AttemptCount, ContextId, TaskId, TaskState};

/// Capacity of the broadcast channel feeding subscribers and sinks
const BROADCAST_CAPACITY: usize = 4096;

/// Severity of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Hub component that emitted an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Registry,
    Transport,
    Dispatcher,
    Dependencies,
    Fanout,
    Hub,
    Api,
}

/// Kind of an event; one per observable state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentRegistered,
    AgentCapabilitiesUpdated,
    AgentDraining,
    AgentDisconnected,
    WorkflowSubmitted,
    TaskPending,
    TaskReady,
    TaskDispatched,
    TaskProgress,
    TaskRetry,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskTimedOut,
    FanoutSplit,
    FanoutAggregated,
    LateReplyDiscarded,
    HubStarted,
    HubShutdown,
}

impl EventType {
    /// Default severity for this event kind
    #[must_use]
    pub fn level(self) -> EventLevel {
        match self {
            Self::TaskFailed
            | Self::TaskTimedOut
            | Self::AgentDisconnected
            | Self::LateReplyDiscarded => EventLevel::Warn,
            Self::TaskProgress => EventLevel::Debug,
            _ => EventLevel::Info,
        }
    }
}

/// One record in the event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the hub-wide total order
    pub seq: u64,
    /// Wall clock, unix epoch milliseconds
    pub wall_ms: u64,
    /// Monotonic microseconds since the log was created
    pub mono_us: u64,
    pub level: EventLevel,
    pub component: Component,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    /// Flat event-specific key/value data
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Reads a numeric field, if present
    #[must_use]
    pub fn field_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(serde_json::Value::as_u64)
    }
}

/// An event under construction, before the log stamps seq and timestamps
#[derive(Debug, Clone)]
pub struct EventDraft {
    component: Component,
    event_type: EventType,
    task_id: Option<TaskId>,
    agent_id: Option<AgentId>,
    context_id: Option<ContextId>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl EventDraft {
    #[must_use]
    pub fn new(component: Component, event_type: EventType) -> Self {
        Self {
            component,
            event_type,
            task_id: None,
            agent_id: None,
            context_id: None,
            fields: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    #[must_use]
    pub fn agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    #[must_use]
    pub fn context(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    #[must_use]
    pub fn field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// The in-process, append-only, total-ordered event stream
pub struct EventLog {
    started: Instant,
    history: Mutex<Vec<Event>>,
    tx: broadcast::Sender<Event>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            started: Instant::now(),
            history: Mutex::new(Vec::new()),
            tx,
        }
    }

    /// Stamps and appends an event, fanning it out to subscribers
    ///
    /// The sequence number is assigned under the history lock, so the vector
    /// order, the seq order, and the broadcast order all agree.
    pub fn append(&self, draft: EventDraft) -> Event {
        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let mono_us = u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX);

        let event = {
            let mut history = self.history.lock().expect("event log lock poisoned");
            let event = Event {
                seq: history.len() as u64,
                wall_ms,
                mono_us,
                level: draft.event_type.level(),
                component: draft.component,
                event_type: draft.event_type,
                task_id: draft.task_id,
                agent_id: draft.agent_id,
                context_id: draft.context_id,
                fields: draft.fields,
            };
            history.push(event.clone());
            // send while holding the lock so broadcast order matches seq order
            let _ = self.tx.send(event.clone());
            event
        };
        event
    }

    /// Subscribes to events appended after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Full copy of the stream so far
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.history.lock().expect("event log lock poisoned").clone()
    }

    /// Number of events appended so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.lock().expect("event log lock poisoned").len()
    }

    /// Whether any event has been appended
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Final state of a task as reconstructed from the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayedTask {
    pub state: TaskState,
    pub attempt: AttemptCount,
}

/// Folds an event stream into the final task-state table
///
/// Replaying the stream a second time yields exactly the same table; the
/// integration suite holds the hub to that.
#[must_use]
pub fn replay<'a>(events: impl IntoIterator<Item = &'a Event>) -> HashMap<TaskId, ReplayedTask> {
    let mut table: HashMap<TaskId, ReplayedTask> = HashMap::new();
    for event in events {
        let Some(task_id) = event.task_id else {
            continue;
        };
        let attempt = event
            .field_u64("attempt")
            .and_then(|a| u32::try_from(a).ok())
            .map(AttemptCount::new);
        let state = match event.event_type {
            EventType::TaskPending => Some(TaskState::Pending),
            EventType::TaskReady => Some(TaskState::Ready),
            EventType::TaskDispatched => Some(TaskState::Dispatched),
            EventType::TaskRetry => Some(TaskState::Pending),
            EventType::TaskCompleted => Some(TaskState::Completed),
            EventType::TaskFailed => Some(TaskState::Failed),
            EventType::TaskCancelled => Some(TaskState::Cancelled),
            EventType::TaskTimedOut => Some(TaskState::TimedOut),
            _ => None,
        };
        if let Some(state) = state {
            let entry = table.entry(task_id).or_insert(ReplayedTask {
                state,
                attempt: AttemptCount::zero(),
            });
            entry.state = state;
            if let Some(attempt) = attempt {
                entry.attempt = attempt;
            }
        }
    }
    table
}

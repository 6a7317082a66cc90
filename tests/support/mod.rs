//! Shared helpers for hub integration tests
//!
//! Tests drive the hub through its public seams: the registry attachment the
//! transport itself uses, the submission methods, and the event stream. A
//! `ChannelAgent` is a scripted agent on an in-process channel, byte-for-byte
//! the same envelopes a WebSocket agent would exchange.

// each test binary uses a different subset of these helpers
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use conflux::config::HubConfig;
use conflux::domain_types::{
    ActionName, AgentId, ContextId, EnvelopeId, MaxRetries, Parallelism, TaskId, TaskPriority,
    TaskState, TaskTimeoutMs,
};
use conflux::events::{Event, EventType};
use conflux::hub::Hub;
use conflux::protocol::{AgentErrorKind, Envelope};
use conflux::registry::Registration;
use conflux::tasks::{DependencyPolicy, FanoutSpec, TaskSpec, WorkflowSpec};

/// Upper bound for anything the hub should do promptly
pub const WAIT: Duration = Duration::from_secs(3);

pub async fn test_hub() -> Arc<Hub> {
    Hub::new(HubConfig::testing()).await.unwrap()
}

pub fn action(name: &str) -> ActionName {
    ActionName::try_new(name.to_string()).unwrap()
}

pub fn agent_id(name: &str) -> AgentId {
    AgentId::try_new(name.to_string()).unwrap()
}

/// A task frame as a scripted agent sees it
#[derive(Debug, Clone)]
pub struct TaskFrame {
    pub task_id: TaskId,
    pub context_id: ContextId,
    pub action: String,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub parent_task_id: Option<TaskId>,
}

/// A scripted agent attached over an in-process channel
pub struct ChannelAgent {
    pub agent_id: AgentId,
    hub: Arc<Hub>,
    outbound: mpsc::Receiver<Envelope>,
}

impl ChannelAgent {
    /// Registers the agent; panics on a registration conflict
    pub fn connect(hub: &Arc<Hub>, name: &str, capabilities: &[&str]) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let id = agent_id(name);
        hub.registry()
            .register(
                Registration {
                    agent_id: id.clone(),
                    capabilities: capabilities.iter().map(|c| action(c)).collect(),
                    max_in_flight: None,
                },
                tx,
            )
            .unwrap();
        Self {
            agent_id: id,
            hub: Arc::clone(hub),
            outbound: rx,
        }
    }

    /// Waits for the next task frame, skipping liveness traffic
    pub async fn expect_task(&mut self) -> TaskFrame {
        loop {
            let envelope = tokio::time::timeout(WAIT, self.outbound.recv())
                .await
                .expect("timed out waiting for a task frame")
                .expect("agent channel closed");
            match envelope {
                Envelope::Task {
                    task_id,
                    context_id,
                    action,
                    payload,
                    attempt,
                    parent_task_id,
                    ..
                } => {
                    return TaskFrame {
                        task_id,
                        context_id,
                        action: action.to_string(),
                        payload,
                        attempt: attempt.as_u32(),
                        parent_task_id,
                    };
                }
                Envelope::Ping { .. } => continue,
                other => panic!("expected a task frame, got {}", other.kind()),
            }
        }
    }

    /// Waits for a cancel frame
    pub async fn expect_cancel(&mut self) -> TaskId {
        loop {
            let envelope = tokio::time::timeout(WAIT, self.outbound.recv())
                .await
                .expect("timed out waiting for a cancel frame")
                .expect("agent channel closed");
            match envelope {
                Envelope::Cancel { task_id, .. } => return task_id,
                Envelope::Ping { .. } => continue,
                other => panic!("expected a cancel frame, got {}", other.kind()),
            }
        }
    }

    pub fn send_result(&self, task_id: TaskId, outcome: serde_json::Value) {
        self.hub.handle_agent_envelope(
            &self.agent_id,
            Envelope::Result {
                id: EnvelopeId::generate(),
                task_id,
                outcome,
                tokens: None,
                cost: None,
            },
        );
    }

    pub fn send_error(&self, task_id: TaskId, kind: AgentErrorKind, message: &str) {
        self.hub.handle_agent_envelope(
            &self.agent_id,
            Envelope::Error {
                id: EnvelopeId::generate(),
                task_id,
                error_kind: kind,
                message: message.to_string(),
            },
        );
    }

    pub fn send_progress(&self, task_id: TaskId, percent: u8) {
        self.hub.handle_agent_envelope(
            &self.agent_id,
            Envelope::Progress {
                id: EnvelopeId::generate(),
                task_id,
                percent: conflux::protocol::ProgressPercent::try_new(percent).unwrap(),
                stage: None,
            },
        );
    }
}

/// A minimal task spec with test-friendly defaults
pub fn task(name: &str, act: &str) -> TaskSpec {
    TaskSpec {
        name: name.to_string(),
        action: action(act),
        payload: serde_json::Value::Null,
        priority: TaskPriority::Normal,
        timeout_ms: None,
        max_retries: None,
        dependencies: Vec::new(),
        dependency_policy: DependencyPolicy::Propagate,
        parallelism: None,
        fanout: None,
    }
}

pub fn with_deps(mut spec: TaskSpec, deps: &[&str]) -> TaskSpec {
    spec.dependencies = deps.iter().map(ToString::to_string).collect();
    spec
}

pub fn with_retries(mut spec: TaskSpec, retries: u32) -> TaskSpec {
    spec.max_retries = Some(MaxRetries::try_new(retries).unwrap());
    spec
}

pub fn with_timeout(mut spec: TaskSpec, timeout_ms: u64) -> TaskSpec {
    spec.timeout_ms = Some(TaskTimeoutMs::try_new(timeout_ms).unwrap());
    spec
}

pub fn with_fanout(mut spec: TaskSpec, parallelism: u32, fanout: FanoutSpec) -> TaskSpec {
    spec.parallelism = Some(Parallelism::try_new(parallelism).unwrap());
    spec.fanout = Some(fanout);
    spec
}

pub fn workflow(tasks: Vec<TaskSpec>) -> WorkflowSpec {
    WorkflowSpec { tasks }
}

/// Polls until the task reaches the expected state
pub async fn wait_task_state(hub: &Hub, task_id: TaskId, state: TaskState) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let current = hub.task_status(task_id).map(|view| view.state);
        if current == Some(state) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} stuck in {current:?}, wanted {state:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until an event matching the predicate has been appended
pub async fn wait_event(hub: &Hub, predicate: impl Fn(&Event) -> bool) -> Event {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(event) = hub.event_log().snapshot().into_iter().find(&predicate) {
            return event;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected event never appeared"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Events for one task, in stream order
pub fn task_events(hub: &Hub, task_id: TaskId) -> Vec<Event> {
    hub.event_log()
        .snapshot()
        .into_iter()
        .filter(|event| event.task_id == Some(task_id))
        .collect()
}

/// Sequence number of the first event of a type for a task
pub fn seq_of(hub: &Hub, task_id: TaskId, event_type: EventType) -> u64 {
    task_events(hub, task_id)
        .into_iter()
        .find(|event| event.event_type == event_type)
        .unwrap_or_else(|| panic!("no {event_type:?} event for {task_id}"))
        .seq
}

/// Asserts the given event kinds appear for the task in exactly this order
pub fn assert_event_order(hub: &Hub, task_id: TaskId, expected: &[EventType]) {
    let kinds: Vec<EventType> = task_events(hub, task_id)
        .into_iter()
        .map(|event| event.event_type)
        .collect();
    assert_eq!(
        kinds, expected,
        "unexpected event order for task {task_id}"
    );
}

//! The coordination hub
//!
//! Owns the task table, the workflow contexts, and the wiring between the
//! registry, dependency manager, dispatcher, fan-out tracking, and event log.
//! Submission operations (`submit`, `cancel_*`, `status`, `subscribe`) live
//! here; the dispatcher loop is in `dispatch`, the agent channel in
//! `transport`.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, HubConfig};
use crate::dispatch::{InFlightTable, ReadyQueue, Resolution};
use crate::deps::{DepEvent, DepNode, DepOutcome, DepsHandle, find_cycle, spawn_dependency_manager};
use crate::domain_types::{
    ActionName, AgentId, AttemptCount, ContextId, FailureKind, Parallelism, RetryPolicy,
    TaskFailure, TaskId, TaskState,
};
use crate::events::{Component, Event, EventDraft, EventLog, EventType};
use crate::fanout::FanoutRegistry;
use crate::protocol::{AgentErrorKind, Envelope, ProgressPercent};
use crate::registry::Registry;
use crate::sink::{SinkError, build_sinks, spawn_sink_runner};
use crate::tasks::{
    AggregatorKind, ContextStatusView, FanoutSpec, SplitStrategy, SubmitReceipt, TaskRecord,
    TaskSpec, TaskStatusView, WorkflowSpec,
};
use crate::timers::{TimerHandle, spawn_timer_wheel};

/// Fatal hub construction errors
#[derive(Debug, Error)]
pub enum HubError {
    #[error("configuration error: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("event sink error: {source}")]
    Sink {
        #[from]
        source: SinkError,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Workflow submission errors; all of them are validation failures
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("workflow has no tasks")]
    EmptyWorkflow,

    #[error("duplicate task name in workflow: {name}")]
    DuplicateName { name: String },

    #[error("task {task} depends on unknown task: {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle involving task: {name}")]
    DependencyCycle { name: String },

    #[error("no custom splitter registered for action: {action}")]
    NoSplitter { action: ActionName },

    #[error("no custom reducer registered for action: {action}")]
    NoReducer { action: ActionName },
}

struct ContextEntry {
    token: CancellationToken,
    tasks: Vec<TaskId>,
}

/// What remains to be done after a task record was marked cancelled
struct CancelCleanup {
    assigned: Option<AgentId>,
    parent: Option<TaskId>,
}

struct FanoutState {
    aggregator: AggregatorKind,
    action: ActionName,
    children: Vec<TaskId>,
    results: Vec<Option<Value>>,
    terminal: Vec<bool>,
    first_failure: Option<TaskFailure>,
    done: bool,
}

enum FanoutDecision {
    Pending,
    FirstSuccess {
        result: Value,
        cancel: Vec<TaskId>,
    },
    AllTerminal {
        results: Option<Vec<Value>>,
        failure: Option<TaskFailure>,
    },
}

/// The coordination hub
pub struct Hub {
    pub(crate) config: HubConfig,
    pub(crate) events: Arc<EventLog>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) tasks: DashMap<TaskId, TaskRecord>,
    contexts: DashMap<ContextId, ContextEntry>,
    pub(crate) ready_queue: Arc<ReadyQueue>,
    pub(crate) inflight: Arc<InFlightTable>,
    pub(crate) timers: TimerHandle,
    pub(crate) deps: DepsHandle,
    fanout_registry: Arc<FanoutRegistry>,
    fanouts: DashMap<TaskId, FanoutState>,
    submit_seq: AtomicU64,
    pub(crate) shutdown: CancellationToken,
    weak_self: Weak<Hub>,
}

impl Hub {
    /// Builds the hub and spawns its background machinery
    ///
    /// # Errors
    /// Returns `HubError` for an invalid configuration or an unreachable
    /// event sink.
    pub async fn new(config: HubConfig) -> Result<Arc<Self>, HubError> {
        Self::with_fanout_registry(config, Arc::new(FanoutRegistry::new())).await
    }

    /// Builds the hub with pre-registered custom splitters and reducers
    ///
    /// # Errors
    /// Returns `HubError` for an invalid configuration or an unreachable
    /// event sink.
    pub async fn with_fanout_registry(
        config: HubConfig,
        fanout_registry: Arc<FanoutRegistry>,
    ) -> Result<Arc<Self>, HubError> {
        config.validate()?;

        let events = Arc::new(EventLog::new());
        let shutdown = CancellationToken::new();

        let sinks = build_sinks(&config.event_log_sinks).await?;
        if !sinks.is_empty() {
            spawn_sink_runner(&events, sinks, shutdown.child_token());
        }

        let registry = Registry::new(Arc::clone(&events), config.reassignment_grace_ms);
        let inflight = Arc::new(InFlightTable::new());
        let timers = spawn_timer_wheel(
            {
                let inflight = Arc::clone(&inflight);
                move |task_id, generation| {
                    inflight.resolve_timeout(task_id, generation);
                }
            },
            shutdown.child_token(),
        );
        let (deps, dep_events) = spawn_dependency_manager(shutdown.child_token());

        let hub = Arc::new_cyclic(|weak_self| Self {
            registry,
            tasks: DashMap::new(),
            contexts: DashMap::new(),
            ready_queue: Arc::new(ReadyQueue::new()),
            inflight,
            timers,
            deps,
            fanout_registry,
            fanouts: DashMap::new(),
            submit_seq: AtomicU64::new(0),
            shutdown,
            events,
            config,
            weak_self: weak_self.clone(),
        });

        tokio::spawn(Arc::clone(&hub).dep_event_loop(dep_events));
        for worker_id in 0..hub.config.max_concurrent_dispatches.as_usize() {
            tokio::spawn(Arc::clone(&hub).dispatcher_worker(worker_id));
        }

        hub.events
            .append(EventDraft::new(Component::Hub, EventType::HubStarted));
        info!(
            listen = %hub.config.listen_address,
            dispatchers = hub.config.max_concurrent_dispatches.as_usize(),
            "hub started"
        );
        Ok(hub)
    }

    /// Initiates shutdown of all background tasks
    pub fn shutdown(&self) {
        self.events
            .append(EventDraft::new(Component::Hub, EventType::HubShutdown));
        self.shutdown.cancel();
    }

    /// Shutdown signal shared with the serving layer
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    #[must_use]
    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.events
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ---- submission surface ----

    /// Accepts a workflow: validates it, creates its context and task
    /// records, and hands the dependency edges to the DAG manager
    ///
    /// # Errors
    /// Returns `SubmitError` for an empty workflow, duplicate names, unknown
    /// or cyclic dependencies, or a missing custom splitter/reducer.
    pub fn submit(&self, workflow: WorkflowSpec) -> Result<SubmitReceipt, SubmitError> {
        if workflow.tasks.is_empty() {
            return Err(SubmitError::EmptyWorkflow);
        }

        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (index, spec) in workflow.tasks.iter().enumerate() {
            if positions.insert(spec.name.as_str(), index).is_some() {
                return Err(SubmitError::DuplicateName {
                    name: spec.name.clone(),
                });
            }
        }

        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); workflow.tasks.len()];
        for (index, spec) in workflow.tasks.iter().enumerate() {
            let mut seen: HashSet<&str> = HashSet::new();
            for dependency in &spec.dependencies {
                if !seen.insert(dependency.as_str()) {
                    continue;
                }
                let target = positions.get(dependency.as_str()).copied().ok_or_else(|| {
                    SubmitError::UnknownDependency {
                        task: spec.name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                edges[index].push(target);
            }
        }
        if let Some(position) = find_cycle(&edges) {
            return Err(SubmitError::DependencyCycle {
                name: workflow.tasks[position].name.clone(),
            });
        }

        for spec in &workflow.tasks {
            let parallelism = spec.parallelism.unwrap_or_default();
            if parallelism.as_usize() > 1 {
                let fanout = spec.fanout.unwrap_or_default();
                if fanout.strategy == SplitStrategy::Custom
                    && !self.fanout_registry.has_splitter(&spec.action)
                {
                    return Err(SubmitError::NoSplitter {
                        action: spec.action.clone(),
                    });
                }
                if fanout.aggregator == AggregatorKind::Custom
                    && !self.fanout_registry.has_reducer(&spec.action)
                {
                    return Err(SubmitError::NoReducer {
                        action: spec.action.clone(),
                    });
                }
            }
        }

        let context_id = ContextId::generate();
        let task_ids: Vec<TaskId> = workflow.tasks.iter().map(|_| TaskId::generate()).collect();

        let mut records = Vec::with_capacity(workflow.tasks.len());
        let mut nodes = Vec::with_capacity(workflow.tasks.len());
        for (index, spec) in workflow.tasks.iter().enumerate() {
            let submit_seq = self.submit_seq.fetch_add(1, Ordering::SeqCst);
            let dependencies: Vec<TaskId> = edges[index].iter().map(|&i| task_ids[i]).collect();
            let record =
                self.build_record(spec, task_ids[index], context_id, dependencies, submit_seq);
            nodes.push(DepNode {
                task_id: record.task_id,
                dependencies: record.dependencies.clone(),
                policy: record.dependency_policy,
                submit_seq,
            });
            records.push(record);
        }

        self.contexts.insert(
            context_id,
            ContextEntry {
                token: CancellationToken::new(),
                tasks: task_ids.clone(),
            },
        );

        self.events.append(
            EventDraft::new(Component::Hub, EventType::WorkflowSubmitted)
                .context(context_id)
                .field("task_count", records.len()),
        );
        for record in records {
            let task_id = record.task_id;
            self.tasks.insert(task_id, record);
            self.events.append(
                EventDraft::new(Component::Hub, EventType::TaskPending)
                    .task(task_id)
                    .context(context_id),
            );
        }

        self.deps.add(nodes);
        debug!(context = %context_id, tasks = task_ids.len(), "workflow submitted");
        Ok(SubmitReceipt {
            context_id,
            task_ids,
        })
    }

    fn build_record(
        &self,
        spec: &TaskSpec,
        task_id: TaskId,
        context_id: ContextId,
        dependencies: Vec<TaskId>,
        submit_seq: u64,
    ) -> TaskRecord {
        let parallelism = spec.parallelism.unwrap_or_default();
        TaskRecord {
            task_id,
            context_id,
            action: spec.action.clone(),
            payload: spec.payload.clone(),
            priority: spec.priority,
            timeout: spec.timeout_ms.unwrap_or(self.config.default_task_timeout_ms),
            retry: RetryPolicy {
                max_retries: spec.max_retries.unwrap_or(self.config.default_max_retries),
                base_backoff: self.config.retry_base_backoff_ms,
                max_backoff: self.config.retry_max_backoff_ms,
            },
            attempt: AttemptCount::zero(),
            dependencies,
            dependency_policy: spec.dependency_policy,
            parallelism,
            fanout: if parallelism.as_usize() > 1 {
                Some(spec.fanout.unwrap_or_default())
            } else {
                None
            },
            parent_task_id: None,
            fanout_index: None,
            state: TaskState::Pending,
            assigned_agent_id: None,
            result: None,
            error: None,
            submit_seq,
        }
    }

    /// Cancels every non-terminal task of a context
    ///
    /// All member tasks reach their terminal state before any release or
    /// propagation runs, so a cancelled dependency can never race its
    /// dependents into `failed` instead of `cancelled`.
    ///
    /// Returns false for an unknown context.
    pub fn cancel_context(&self, context_id: ContextId) -> bool {
        let task_ids = {
            let Some(entry) = self.contexts.get(&context_id) else {
                return false;
            };
            entry.token.cancel();
            entry.tasks.clone()
        };
        info!(context = %context_id, "context cancelled");

        let marked: Vec<(TaskId, CancelCleanup)> = task_ids
            .into_iter()
            .filter_map(|task_id| self.cancel_mark(task_id).map(|cleanup| (task_id, cleanup)))
            .collect();
        for (task_id, cleanup) in marked {
            self.cancel_finish(task_id, cleanup);
        }
        true
    }

    /// Cancels one task: immediate terminal transition, best-effort `cancel`
    /// to any assigned agent, no ack awaited
    ///
    /// Returns false for an unknown task; an already-terminal task is a
    /// successful no-op.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        match self.cancel_mark(task_id) {
            Some(cleanup) => {
                self.cancel_finish(task_id, cleanup);
                true
            }
            None => self.tasks.contains_key(&task_id),
        }
    }

    /// `* -> cancelled` under the record lock; None if unknown or terminal
    fn cancel_mark(&self, task_id: TaskId) -> Option<CancelCleanup> {
        let mut record = self.tasks.get_mut(&task_id)?;
        if record.state.is_terminal() {
            return None;
        }
        let assigned = record.assigned_agent_id.take();
        record.state = TaskState::Cancelled;
        record.error = Some(TaskFailure::new(FailureKind::Cancelled, "cancelled"));
        self.events.append(
            EventDraft::new(Component::Hub, EventType::TaskCancelled)
                .task(task_id)
                .context(record.context_id),
        );
        Some(CancelCleanup {
            assigned,
            parent: record.parent_task_id,
        })
    }

    /// Releases the dispatcher, notifies the agent, and propagates
    fn cancel_finish(&self, task_id: TaskId, cleanup: CancelCleanup) {
        if let Some(agent_id) = cleanup.assigned {
            // release the dispatcher's await; it handles timer and load
            self.inflight.resolve(task_id, Resolution::Cancelled);
            let cancel = Envelope::Cancel {
                id: crate::domain_types::EnvelopeId::generate(),
                task_id,
            };
            if let Err(error) = self.registry.send(&agent_id, cancel) {
                debug!(task = %task_id, agent = %agent_id, %error, "cancel not delivered");
            }
        }

        self.deps.resolved(task_id, DepOutcome::Cancelled);
        self.cancel_fanout_children(task_id);
        if let Some(parent) = cleanup.parent {
            self.on_child_terminal(parent, task_id);
        }
    }

    fn cancel_fanout_children(&self, parent_id: TaskId) {
        let children = {
            let Some(mut state) = self.fanouts.get_mut(&parent_id) else {
                return;
            };
            if state.done {
                return;
            }
            state.done = true;
            state.children.clone()
        };
        for child in children {
            self.cancel_task(child);
        }
    }

    /// Current state of one task
    #[must_use]
    pub fn task_status(&self, task_id: TaskId) -> Option<TaskStatusView> {
        self.tasks.get(&task_id).map(|record| (&*record).into())
    }

    /// Current state of every task in a context
    #[must_use]
    pub fn context_status(&self, context_id: ContextId) -> Option<ContextStatusView> {
        let entry = self.contexts.get(&context_id)?;
        let tasks = entry
            .tasks
            .iter()
            .filter_map(|task_id| self.task_status(*task_id))
            .collect();
        Some(ContextStatusView { context_id, tasks })
    }

    /// Whether every task of the context has reached a terminal state
    #[must_use]
    pub fn context_is_terminal(&self, context_id: ContextId) -> bool {
        self.contexts.get(&context_id).is_some_and(|entry| {
            entry.tasks.iter().all(|task_id| {
                self.tasks
                    .get(task_id)
                    .is_none_or(|record| record.state.is_terminal())
            })
        })
    }

    /// History-plus-live subscription for one context's events
    ///
    /// The snapshot and the receiver overlap rather than gap: events
    /// appended between the two calls appear in both; consumers dedupe by
    /// `seq`.
    #[must_use]
    pub fn subscribe(
        &self,
        context_id: ContextId,
    ) -> (Vec<Event>, tokio::sync::broadcast::Receiver<Event>) {
        let receiver = self.events.subscribe();
        let history = self
            .events
            .snapshot()
            .into_iter()
            .filter(|event| event.context_id == Some(context_id))
            .collect();
        (history, receiver)
    }

    // ---- inbound agent traffic ----

    /// Routes one envelope from a connected agent
    pub fn handle_agent_envelope(&self, agent_id: &AgentId, envelope: Envelope) {
        self.registry.mark_traffic(agent_id);
        match envelope {
            Envelope::Result {
                task_id,
                outcome,
                tokens,
                cost,
                ..
            } => {
                let resolved = self.inflight.resolve_if_agent(
                    task_id,
                    agent_id,
                    Resolution::Result {
                        outcome,
                        tokens,
                        cost,
                    },
                );
                if !resolved {
                    self.log_late_reply(task_id, agent_id, "result");
                }
            }
            Envelope::Error {
                task_id,
                error_kind,
                message,
                ..
            } => {
                let resolved = self.inflight.resolve_if_agent(
                    task_id,
                    agent_id,
                    Resolution::AgentError {
                        kind: error_kind,
                        message,
                    },
                );
                if !resolved {
                    self.log_late_reply(task_id, agent_id, "error");
                }
            }
            Envelope::Progress {
                task_id,
                percent,
                stage,
                ..
            } => self.record_progress(task_id, agent_id, percent, stage),
            Envelope::Heartbeat { status, .. } => self.registry.heartbeat(agent_id, status),
            Envelope::Register {
                capabilities,
                max_in_flight,
                ..
            } => {
                if let Err(error) =
                    self.registry
                        .update_capabilities(agent_id, capabilities, max_in_flight)
                {
                    warn!(agent = %agent_id, %error, "re-registration rejected");
                }
            }
            Envelope::Pong { .. } => {}
            Envelope::Ping { .. } => {
                let pong = Envelope::Pong {
                    id: crate::domain_types::EnvelopeId::generate(),
                };
                let _ = self.registry.send(agent_id, pong);
            }
            other @ (Envelope::Task { .. } | Envelope::Cancel { .. }) => {
                warn!(agent = %agent_id, kind = other.kind(), "agent sent a hub-only envelope");
            }
        }
    }

    /// Marks an agent gone and reassigns its in-flight tasks
    pub fn disconnect_agent(&self, agent_id: &AgentId, reason: &str) {
        if !self.registry.disconnect(agent_id, reason) {
            return;
        }
        for task_id in self.inflight.tasks_for_agent(agent_id) {
            self.inflight
                .resolve_if_agent(task_id, agent_id, Resolution::AgentLost);
        }
    }

    fn record_progress(
        &self,
        task_id: TaskId,
        agent_id: &AgentId,
        percent: ProgressPercent,
        stage: Option<String>,
    ) {
        let Some(record) = self.tasks.get(&task_id) else {
            return;
        };
        if record.state != TaskState::Dispatched
            || record.assigned_agent_id.as_ref() != Some(agent_id)
        {
            return;
        }
        let context_id = record.context_id;
        let mut draft = EventDraft::new(Component::Dispatcher, EventType::TaskProgress)
            .task(task_id)
            .agent(agent_id.clone())
            .context(context_id)
            .field("percent", percent.as_u8());
        if let Some(stage) = stage {
            draft = draft.field("stage", stage);
        }
        // emit under the record lock so progress never trails a terminal event
        self.events.append(draft);
    }

    fn log_late_reply(&self, task_id: TaskId, agent_id: &AgentId, kind: &str) {
        self.events.append(
            EventDraft::new(Component::Dispatcher, EventType::LateReplyDiscarded)
                .task(task_id)
                .agent(agent_id.clone())
                .field("reply_kind", kind),
        );
    }

    // ---- dependency promotions ----

    async fn dep_event_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<DepEvent>) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(DepEvent::Ready { task_id }) => self.on_task_ready(task_id),
                    Some(DepEvent::DependencyFailed { task_id, failed_dependency }) => {
                        self.fail_task(
                            task_id,
                            FailureKind::DependencyFailed,
                            format!("dependency {failed_dependency} did not complete"),
                        );
                    }
                    None => break,
                },
            }
        }
        debug!("dependency promotion loop stopped");
    }

    fn on_task_ready(&self, task_id: TaskId) {
        if self.context_of(task_id).is_some_and(|t| t.is_cancelled()) {
            return;
        }
        let is_fanout = self
            .tasks
            .get(&task_id)
            .is_some_and(|record| record.state == TaskState::Pending && record.is_fanout_parent());
        if is_fanout {
            self.start_fanout(task_id);
        } else if self.mark_ready(task_id) {
            let priority = self
                .tasks
                .get(&task_id)
                .map(|record| record.priority)
                .unwrap_or_default();
            self.ready_queue.push(priority, task_id);
        }
    }

    fn context_of(&self, task_id: TaskId) -> Option<CancellationToken> {
        let context_id = self.tasks.get(&task_id)?.context_id;
        self.contexts
            .get(&context_id)
            .map(|entry| entry.token.clone())
    }

    /// Cancellation token of a context, for the dispatcher's pre-dispatch
    /// check
    #[must_use]
    pub(crate) fn context_token(&self, context_id: ContextId) -> Option<CancellationToken> {
        self.contexts
            .get(&context_id)
            .map(|entry| entry.token.clone())
    }

    // ---- state transitions ----

    /// `pending -> ready`; false if the task moved on meanwhile
    pub(crate) fn mark_ready(&self, task_id: TaskId) -> bool {
        let Some(mut record) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        if record.state != TaskState::Pending {
            return false;
        }
        record.state = TaskState::Ready;
        self.events.append(
            EventDraft::new(Component::Dependencies, EventType::TaskReady)
                .task(task_id)
                .context(record.context_id),
        );
        true
    }

    /// Terminal success; stores the result and releases dependents
    pub(crate) fn complete_task(
        &self,
        task_id: TaskId,
        outcome: Value,
        tokens: Option<Value>,
        cost: Option<Value>,
    ) {
        let parent = {
            let Some(mut record) = self.tasks.get_mut(&task_id) else {
                return;
            };
            if record.state.is_terminal() {
                return;
            }
            record.state = TaskState::Completed;
            record.result = Some(outcome);
            let agent = record.assigned_agent_id.take();
            let mut draft = EventDraft::new(Component::Dispatcher, EventType::TaskCompleted)
                .task(task_id)
                .context(record.context_id)
                .field("attempt", record.attempt.as_u32());
            if let Some(agent) = agent {
                draft = draft.agent(agent);
            }
            if let Some(tokens) = tokens {
                draft = draft.field("tokens", tokens);
            }
            if let Some(cost) = cost {
                draft = draft.field("cost", cost);
            }
            self.events.append(draft);
            record.parent_task_id
        };

        self.deps.resolved(task_id, DepOutcome::Completed);
        if let Some(parent) = parent {
            self.on_child_terminal(parent, task_id);
        }
    }

    /// Terminal failure; propagates to dependents and any fan-out parent
    pub(crate) fn fail_task(&self, task_id: TaskId, kind: FailureKind, message: String) -> bool {
        let parent = {
            let Some(mut record) = self.tasks.get_mut(&task_id) else {
                return false;
            };
            if record.state.is_terminal() {
                return false;
            }
            record.state = TaskState::Failed;
            record.error = Some(TaskFailure::new(kind, message.clone()));
            let agent = record.assigned_agent_id.take();
            let mut draft = EventDraft::new(Component::Dispatcher, EventType::TaskFailed)
                .task(task_id)
                .context(record.context_id)
                .field("kind", serde_json::to_value(kind).unwrap_or(Value::Null))
                .field("message", message);
            if let Some(agent) = agent {
                draft = draft.agent(agent);
            }
            self.events.append(draft);
            record.parent_task_id
        };

        self.deps.resolved(task_id, DepOutcome::Failed);
        self.cancel_fanout_children(task_id);
        if let Some(parent) = parent {
            self.on_child_terminal(parent, task_id);
        }
        true
    }

    /// Terminal timeout after retries ran out
    pub(crate) fn timeout_task_terminal(&self, task_id: TaskId, agent_id: &AgentId) {
        let parent = {
            let Some(mut record) = self.tasks.get_mut(&task_id) else {
                return;
            };
            if record.state.is_terminal() {
                return;
            }
            record.state = TaskState::TimedOut;
            record.error = Some(TaskFailure::new(
                FailureKind::Timeout,
                format!("no reply within {}ms", record.timeout.as_u64()),
            ));
            record.assigned_agent_id = None;
            self.events.append(
                EventDraft::new(Component::Dispatcher, EventType::TaskTimedOut)
                    .task(task_id)
                    .agent(agent_id.clone())
                    .context(record.context_id)
                    .field("attempt", record.attempt.as_u32()),
            );
            record.parent_task_id
        };

        self.deps.resolved(task_id, DepOutcome::Failed);
        if let Some(parent) = parent {
            self.on_child_terminal(parent, task_id);
        }
    }

    // ---- fan-out ----

    fn start_fanout(&self, parent_id: TaskId) {
        let Some(record) = self.tasks.get(&parent_id) else {
            return;
        };
        let (action, payload, fanout, n, context_id, priority, timeout, retry) = (
            record.action.clone(),
            record.payload.clone(),
            record.fanout.unwrap_or_default(),
            record.parallelism.as_usize(),
            record.context_id,
            record.priority,
            record.timeout,
            record.retry,
        );
        drop(record);

        let parts = match self
            .fanout_registry
            .split(fanout.strategy, &action, &payload, n)
        {
            Ok(parts) => parts,
            Err(error) => {
                self.fail_task(parent_id, FailureKind::Validation, error.to_string());
                return;
            }
        };

        if !self.mark_ready(parent_id) {
            return;
        }
        self.events.append(
            EventDraft::new(Component::Fanout, EventType::FanoutSplit)
                .task(parent_id)
                .context(context_id)
                .field("sub_tasks", n)
                .field(
                    "strategy",
                    serde_json::to_value(fanout.strategy).unwrap_or(Value::Null),
                ),
        );

        let mut children = Vec::with_capacity(n);
        for (index, part) in parts.into_iter().enumerate() {
            let child_id = TaskId::generate();
            let submit_seq = self.submit_seq.fetch_add(1, Ordering::SeqCst);
            let child = TaskRecord {
                task_id: child_id,
                context_id,
                action: action.clone(),
                payload: part,
                priority,
                timeout,
                retry,
                attempt: AttemptCount::zero(),
                dependencies: Vec::new(),
                dependency_policy: crate::tasks::DependencyPolicy::Propagate,
                parallelism: Parallelism::default(),
                fanout: None,
                parent_task_id: Some(parent_id),
                fanout_index: Some(index),
                state: TaskState::Pending,
                assigned_agent_id: None,
                result: None,
                error: None,
                submit_seq,
            };
            self.tasks.insert(child_id, child);
            if let Some(mut context) = self.contexts.get_mut(&context_id) {
                context.tasks.push(child_id);
            }
            self.events.append(
                EventDraft::new(Component::Fanout, EventType::TaskPending)
                    .task(child_id)
                    .context(context_id),
            );
            children.push(child_id);
        }

        self.fanouts.insert(
            parent_id,
            FanoutState {
                aggregator: fanout.aggregator,
                action,
                children: children.clone(),
                results: vec![None; n],
                terminal: vec![false; n],
                first_failure: None,
                done: false,
            },
        );

        for child_id in children {
            if self.mark_ready(child_id) {
                self.ready_queue.push(priority, child_id);
            }
        }
    }

    fn on_child_terminal(&self, parent_id: TaskId, child_id: TaskId) {
        let child_outcome = {
            let Some(child) = self.tasks.get(&child_id) else {
                return;
            };
            (
                child.fanout_index,
                child.state,
                child.result.clone(),
                child.error.clone(),
            )
        };
        let (Some(index), child_state, child_result, child_error) = child_outcome else {
            return;
        };

        let decision = {
            let Some(mut state) = self.fanouts.get_mut(&parent_id) else {
                return;
            };
            if state.done || index >= state.terminal.len() || state.terminal[index] {
                return;
            }
            state.terminal[index] = true;

            match child_state {
                TaskState::Completed => {
                    let result = child_result.unwrap_or(Value::Null);
                    if state.aggregator == AggregatorKind::FirstSuccess {
                        state.done = true;
                        let cancel = state
                            .children
                            .iter()
                            .copied()
                            .filter(|child| *child != child_id)
                            .collect();
                        FanoutDecision::FirstSuccess { result, cancel }
                    } else {
                        state.results[index] = Some(result);
                        Self::fanout_progress(&mut state)
                    }
                }
                _ => {
                    if state.first_failure.is_none() {
                        state.first_failure = Some(child_error.unwrap_or_else(|| {
                            TaskFailure::new(FailureKind::Transient, "sub-task did not complete")
                        }));
                    }
                    Self::fanout_progress(&mut state)
                }
            }
        };

        match decision {
            FanoutDecision::Pending => {}
            FanoutDecision::FirstSuccess { result, cancel } => {
                // siblings reach their terminal state before the parent does
                for sibling in cancel {
                    self.cancel_task(sibling);
                }
                self.events.append(
                    EventDraft::new(Component::Fanout, EventType::FanoutAggregated)
                        .task(parent_id)
                        .field("winner", child_id.to_string()),
                );
                self.complete_task(parent_id, result, None, None);
            }
            FanoutDecision::AllTerminal { results, failure } => {
                if let Some(failure) = failure {
                    self.fail_task(
                        parent_id,
                        failure.kind,
                        format!("sub-task failed: {}", failure.message),
                    );
                    return;
                }
                let results = results.unwrap_or_default();
                let (aggregator, action) = {
                    let Some(state) = self.fanouts.get(&parent_id) else {
                        return;
                    };
                    (state.aggregator, state.action.clone())
                };
                match self.fanout_registry.aggregate(aggregator, &action, results) {
                    Ok(combined) => {
                        self.events.append(
                            EventDraft::new(Component::Fanout, EventType::FanoutAggregated)
                                .task(parent_id)
                                .field(
                                    "aggregator",
                                    serde_json::to_value(aggregator).unwrap_or(Value::Null),
                                ),
                        );
                        self.complete_task(parent_id, combined, None, None);
                    }
                    Err(error) => {
                        self.fail_task(parent_id, FailureKind::Validation, error.to_string());
                    }
                }
            }
        }
    }

    /// Decides whether a fan-out is finished, under the tracker lock
    fn fanout_progress(state: &mut FanoutState) -> FanoutDecision {
        if !state.terminal.iter().all(|done| *done) {
            return FanoutDecision::Pending;
        }
        state.done = true;
        if state.aggregator == AggregatorKind::FirstSuccess || state.first_failure.is_some() {
            return FanoutDecision::AllTerminal {
                results: None,
                failure: Some(state.first_failure.take().unwrap_or_else(|| {
                    TaskFailure::new(FailureKind::Transient, "no sub-task completed")
                })),
            };
        }
        FanoutDecision::AllTerminal {
            results: Some(
                state
                    .results
                    .iter()
                    .map(|result| result.clone().unwrap_or(Value::Null))
                    .collect(),
            ),
            failure: None,
        }
    }

    /// Weak handle to this hub for spawned helpers that may outlive it
    pub(crate) fn weak_self(&self) -> Weak<Hub> {
        self.weak_self.clone()
    }

    /// Maps a retryable agent error kind onto the internal taxonomy
    pub(crate) fn failure_kind_for(kind: AgentErrorKind) -> FailureKind {
        match kind {
            AgentErrorKind::Validation => FailureKind::Validation,
            AgentErrorKind::Permanent => FailureKind::Permanent,
            AgentErrorKind::Cancelled => FailureKind::Cancelled,
            AgentErrorKind::Transient | AgentErrorKind::TimeoutAgent => FailureKind::Transient,
        }
    }
}

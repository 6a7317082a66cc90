//! Task dispatch: ready queue, in-flight tracking, timeouts, retries
//!
//! Dispatcher workers pull one ready task at a time, book a capable agent
//! through the registry, send the task frame, and await exactly one
//! resolution: the agent's reply, the deadline, an agent loss, or a
//! cancellation. Whoever removes the in-flight entry wins; everyone else's
//! signal for that attempt is late and gets logged, not delivered.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, trace, warn};

use crate::domain_types::{
    AgentId, AttemptCount, EnvelopeId, FailureKind, TaskId, TaskPriority, TaskState,
};
use crate::events::{Component, EventDraft, EventType};
use crate::hub::Hub;
use crate::protocol::{AgentErrorKind, Envelope};

/// How long a worker sits out when no capable agent is available, absent a
/// registry change
const DISPATCH_QUIESCENCE: Duration = Duration::from_millis(50);

/// How one dispatch attempt ended
#[derive(Debug)]
pub enum Resolution {
    Result {
        outcome: Value,
        tokens: Option<Value>,
        cost: Option<Value>,
    },
    AgentError {
        kind: AgentErrorKind,
        message: String,
    },
    Timeout,
    AgentLost,
    SendFailed,
    Cancelled,
}

struct InFlightEntry {
    agent_id: AgentId,
    attempt: u32,
    tx: oneshot::Sender<Resolution>,
}

/// Table of dispatched attempts awaiting resolution
///
/// Removal is the commit point: the first resolver takes the entry and its
/// oneshot; a later result or timer for the same attempt finds nothing.
pub struct InFlightTable {
    entries: DashMap<TaskId, InFlightEntry>,
}

impl InFlightTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub(crate) fn insert(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
        tx: oneshot::Sender<Resolution>,
    ) {
        self.entries.insert(
            task_id,
            InFlightEntry {
                agent_id,
                attempt,
                tx,
            },
        );
    }

    /// Resolves regardless of assignment; used by cancellation
    pub(crate) fn resolve(&self, task_id: TaskId, resolution: Resolution) -> bool {
        if let Some((_, entry)) = self.entries.remove(&task_id) {
            let _ = entry.tx.send(resolution);
            true
        } else {
            false
        }
    }

    /// Resolves only if the attempt is assigned to `agent_id`
    pub(crate) fn resolve_if_agent(
        &self,
        task_id: TaskId,
        agent_id: &AgentId,
        resolution: Resolution,
    ) -> bool {
        if let Some((_, entry)) = self
            .entries
            .remove_if(&task_id, |_, entry| entry.agent_id == *agent_id)
        {
            let _ = entry.tx.send(resolution);
            true
        } else {
            false
        }
    }

    /// Resolves only the attempt the deadline was armed for
    pub(crate) fn resolve_timeout(&self, task_id: TaskId, generation: u32) -> bool {
        if let Some((_, entry)) = self
            .entries
            .remove_if(&task_id, |_, entry| entry.attempt == generation)
        {
            let _ = entry.tx.send(Resolution::Timeout);
            true
        } else {
            false
        }
    }

    /// Tasks currently dispatched to one agent
    #[must_use]
    pub(crate) fn tasks_for_agent(&self, agent_id: &AgentId) -> Vec<TaskId> {
        self.entries
            .iter()
            .filter(|entry| entry.agent_id == *agent_id)
            .map(|entry| *entry.key())
            .collect()
    }
}

impl Default for InFlightTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Strict-priority FIFO of dispatchable tasks
///
/// Critical drains before high, high before normal, normal before low; one
/// class is FIFO. A task that found no capable agent goes back to the head
/// of its class.
pub struct ReadyQueue {
    classes: Mutex<[VecDeque<TaskId>; TaskPriority::CLASSES]>,
    notify: Notify,
}

impl ReadyQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            classes: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            notify: Notify::new(),
        }
    }

    /// Appends to the tail of the task's priority class
    pub fn push(&self, priority: TaskPriority, task_id: TaskId) {
        self.classes.lock().expect("ready queue lock poisoned")[priority.class_index()]
            .push_back(task_id);
        self.notify.notify_one();
    }

    /// Returns a task to the head of its priority class
    pub fn push_front(&self, priority: TaskPriority, task_id: TaskId) {
        self.classes.lock().expect("ready queue lock poisoned")[priority.class_index()]
            .push_front(task_id);
        self.notify.notify_one();
    }

    /// Non-blocking pop in strict priority order
    #[must_use]
    pub fn try_pop(&self) -> Option<TaskId> {
        let mut classes = self.classes.lock().expect("ready queue lock poisoned");
        let popped = classes.iter_mut().find_map(VecDeque::pop_front);
        if popped.is_some() && classes.iter().any(|class| !class.is_empty()) {
            // keep waking peers while work remains
            self.notify.notify_one();
        }
        popped
    }

    /// Waits for the next dispatchable task
    pub async fn pop(&self) -> TaskId {
        loop {
            let notified = self.notify.notified();
            if let Some(task_id) = self.try_pop() {
                return task_id;
            }
            notified.await;
        }
    }

    /// Queued task count across all classes
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes
            .lock()
            .expect("ready queue lock poisoned")
            .iter()
            .map(VecDeque::len)
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    /// One dispatcher worker: pull a ready task, drive one attempt, repeat
    pub(crate) async fn dispatcher_worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "dispatcher worker started");
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                task_id = self.ready_queue.pop() => self.drive_task(task_id).await,
            }
        }
        debug!(worker_id, "dispatcher worker stopped");
    }

    /// Drives one dispatch attempt for a task popped from the ready queue
    async fn drive_task(&self, task_id: TaskId) {
        let Some((action, priority, context_id)) = self
            .tasks
            .get(&task_id)
            .filter(|record| record.state == TaskState::Ready)
            .map(|record| (record.action.clone(), record.priority, record.context_id))
        else {
            return;
        };
        if self
            .context_token(context_id)
            .is_some_and(|token| token.is_cancelled())
        {
            return;
        }

        let Some(agent_id) = self.registry.try_assign(&action) else {
            // park at the head of the class until the registry changes
            self.ready_queue.push_front(priority, task_id);
            let mut changed = self.registry.changed();
            tokio::select! {
                _ = changed.changed() => {}
                () = tokio::time::sleep(DISPATCH_QUIESCENCE) => {}
                () = self.shutdown.cancelled() => {}
            }
            return;
        };

        let Some(envelope) = self.mark_dispatched(task_id, &agent_id) else {
            // cancelled between pop and booking
            self.registry.release(&agent_id);
            return;
        };

        let attempt = match &envelope {
            Envelope::Task { attempt, .. } => attempt.as_u32(),
            _ => 0,
        };
        let timeout = self
            .tasks
            .get(&task_id)
            .map(|record| record.timeout.as_duration())
            .unwrap_or_default();

        let (tx, rx) = oneshot::channel();
        self.inflight.insert(task_id, agent_id.clone(), attempt, tx);
        self.timers
            .arm(task_id, attempt, tokio::time::Instant::now() + timeout);

        // a cancel may have landed between the dispatch transition and the
        // in-flight insert; it found no entry to resolve, so resolve here
        let still_dispatched = self
            .tasks
            .get(&task_id)
            .is_some_and(|record| record.state == TaskState::Dispatched);
        if !still_dispatched {
            self.inflight.resolve(task_id, Resolution::Cancelled);
        } else if let Err(error) = self.registry.send(&agent_id, envelope) {
            trace!(task = %task_id, agent = %agent_id, %error, "task frame not enqueued");
            self.inflight.resolve(task_id, Resolution::SendFailed);
        }

        let resolution = rx.await.unwrap_or(Resolution::AgentLost);
        self.finish_attempt(task_id, &agent_id, attempt, resolution);
    }

    /// `ready -> dispatched` under the record lock; builds the task frame
    fn mark_dispatched(&self, task_id: TaskId, agent_id: &AgentId) -> Option<Envelope> {
        let mut record = self.tasks.get_mut(&task_id)?;
        if record.state != TaskState::Ready {
            return None;
        }
        record.state = TaskState::Dispatched;
        record.assigned_agent_id = Some(agent_id.clone());
        self.events.append(
            EventDraft::new(Component::Dispatcher, EventType::TaskDispatched)
                .task(task_id)
                .agent(agent_id.clone())
                .context(record.context_id)
                .field("attempt", record.attempt.as_u32())
                .field("action", record.action.to_string()),
        );
        Some(Envelope::Task {
            id: EnvelopeId::generate(),
            task_id,
            context_id: record.context_id,
            action: record.action.clone(),
            payload: record.payload.clone(),
            priority: record.priority,
            timeout_ms: record.timeout.as_u64(),
            attempt: record.attempt,
            parent_task_id: record.parent_task_id,
        })
    }

    /// Applies one attempt's resolution: terminal transition or retry
    fn finish_attempt(
        &self,
        task_id: TaskId,
        agent_id: &AgentId,
        attempt: u32,
        resolution: Resolution,
    ) {
        self.timers.cancel(task_id, attempt);
        self.registry.release(agent_id);

        match resolution {
            Resolution::Result {
                outcome,
                tokens,
                cost,
            } => self.complete_task(task_id, outcome, tokens, cost),
            Resolution::AgentError { kind, message } => {
                if kind.is_retryable() {
                    self.retry_or_fail(task_id, FailureKind::Transient, &message, None);
                } else {
                    self.fail_task(task_id, Hub::failure_kind_for(kind), message);
                }
            }
            Resolution::Timeout => {
                self.retry_or_fail(
                    task_id,
                    FailureKind::Timeout,
                    "no reply within deadline",
                    Some(agent_id),
                );
            }
            Resolution::AgentLost => {
                self.retry_or_fail(task_id, FailureKind::Transient, "agent disconnected", None);
            }
            Resolution::SendFailed => {
                self.retry_or_fail(
                    task_id,
                    FailureKind::Transient,
                    "task frame could not be written",
                    None,
                );
            }
            Resolution::Cancelled => {
                // the cancel path already transitioned and emitted
            }
        }
    }

    /// Retries with exponential backoff, or lands the terminal failure
    ///
    /// `timed_out_agent` is set when the resolution was a deadline fire: a
    /// `task_timed_out` event precedes either the retry or the terminal
    /// transition.
    fn retry_or_fail(
        &self,
        task_id: TaskId,
        exhausted_kind: FailureKind,
        reason: &str,
        timed_out_agent: Option<&AgentId>,
    ) {
        let retry = {
            let Some(mut record) = self.tasks.get_mut(&task_id) else {
                return;
            };
            if record.state != TaskState::Dispatched {
                // cancelled while the resolution was in flight
                return;
            }
            let failed_attempt = record.attempt;
            if record.retry.allows_retry_after(failed_attempt) {
                if let Some(agent_id) = timed_out_agent {
                    self.events.append(
                        EventDraft::new(Component::Dispatcher, EventType::TaskTimedOut)
                            .task(task_id)
                            .agent(agent_id.clone())
                            .context(record.context_id)
                            .field("attempt", failed_attempt.as_u32()),
                    );
                }
                let backoff = record.retry.backoff_after(failed_attempt);
                record.state = TaskState::Pending;
                record.attempt = failed_attempt.increment();
                record.assigned_agent_id = None;
                self.events.append(
                    EventDraft::new(Component::Dispatcher, EventType::TaskRetry)
                        .task(task_id)
                        .context(record.context_id)
                        .field("attempt", record.attempt.as_u32())
                        .field("backoff_ms", u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX))
                        .field("reason", reason),
                );
                Some(backoff)
            } else {
                None
            }
        };

        match retry {
            Some(backoff) => self.schedule_requeue(task_id, backoff),
            None => {
                if let Some(agent_id) = timed_out_agent {
                    self.timeout_task_terminal(task_id, agent_id);
                } else {
                    self.fail_task(
                        task_id,
                        exhausted_kind,
                        format!("retries exhausted: {reason}"),
                    );
                }
            }
        }
    }

    /// Re-enqueues a retried task after its backoff, unless it was cancelled
    /// in the meantime
    fn schedule_requeue(&self, task_id: TaskId, backoff: Duration) {
        let weak = self.weak_self();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let Some(hub) = weak.upgrade() else {
                return;
            };
            if hub.shutdown.is_cancelled() {
                return;
            }
            let Some(priority) = hub
                .tasks
                .get(&task_id)
                .filter(|record| record.state == TaskState::Pending)
                .map(|record| record.priority)
            else {
                return;
            };
            if hub.mark_ready(task_id) {
                hub.ready_queue.push(priority, task_id);
            } else {
                warn!(task = %task_id, "retried task moved on before requeue");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_queue_is_strict_priority_fifo() {
        let queue = ReadyQueue::new();
        let low = TaskId::generate();
        let normal_1 = TaskId::generate();
        let normal_2 = TaskId::generate();
        let critical = TaskId::generate();

        queue.push(TaskPriority::Low, low);
        queue.push(TaskPriority::Normal, normal_1);
        queue.push(TaskPriority::Normal, normal_2);
        queue.push(TaskPriority::Critical, critical);

        assert_eq!(queue.try_pop(), Some(critical));
        assert_eq!(queue.try_pop(), Some(normal_1));
        assert_eq!(queue.try_pop(), Some(normal_2));
        assert_eq!(queue.try_pop(), Some(low));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn push_front_returns_to_head_of_class() {
        let queue = ReadyQueue::new();
        let first = TaskId::generate();
        let second = TaskId::generate();
        queue.push(TaskPriority::Normal, first);
        queue.push(TaskPriority::Normal, second);

        let popped = queue.try_pop().unwrap();
        queue.push_front(TaskPriority::Normal, popped);
        assert_eq!(queue.try_pop(), Some(first));
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(ReadyQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;

        let task = TaskId::generate();
        queue.push(TaskPriority::High, task);
        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, task);
    }

    #[tokio::test]
    async fn inflight_first_resolution_wins() {
        let table = InFlightTable::new();
        let task = TaskId::generate();
        let agent = AgentId::try_new("a".to_string()).unwrap();
        let (tx, mut rx) = oneshot::channel();
        table.insert(task, agent.clone(), 0, tx);

        assert!(table.resolve_timeout(task, 0));
        assert!(!table.resolve_if_agent(
            task,
            &agent,
            Resolution::Result {
                outcome: Value::Null,
                tokens: None,
                cost: None,
            },
        ));
        assert!(matches!(rx.try_recv(), Ok(Resolution::Timeout)));
    }

    #[tokio::test]
    async fn inflight_timeout_for_stale_generation_is_ignored() {
        let table = InFlightTable::new();
        let task = TaskId::generate();
        let agent = AgentId::try_new("a".to_string()).unwrap();
        let (tx, mut rx) = oneshot::channel();
        table.insert(task, agent, 1, tx);

        assert!(!table.resolve_timeout(task, 0));
        assert!(rx.try_recv().is_err());
        assert!(table.resolve_timeout(task, 1));
    }

    #[tokio::test]
    async fn inflight_wrong_agent_cannot_resolve() {
        let table = InFlightTable::new();
        let task = TaskId::generate();
        let assigned = AgentId::try_new("assigned".to_string()).unwrap();
        let imposter = AgentId::try_new("imposter".to_string()).unwrap();
        let (tx, _rx) = oneshot::channel();
        table.insert(task, assigned.clone(), 0, tx);

        assert!(!table.resolve_if_agent(
            task,
            &imposter,
            Resolution::AgentError {
                kind: AgentErrorKind::Transient,
                message: String::new(),
            },
        ));
        assert_eq!(table.tasks_for_agent(&assigned), vec![task]);
    }
}

//! Dependency manager
//!
//! A single task owns the DAG of pending tasks; every other component talks
//! to it by message. Completions remove edges and promote tasks whose last
//! dependency just resolved; failures and cancellations propagate to
//! dependents according to each dependent's declared policy. Cycle rejection
//! happens synchronously at submission, before any task reaches this
//! manager, so the command surface here is fire-and-forget.

use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::domain_types::TaskId;
use crate::tasks::DependencyPolicy;

/// Terminal outcome of a task, as the DAG cares about it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl DepOutcome {
    fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// One node handed to the manager at submission
#[derive(Debug, Clone)]
pub struct DepNode {
    pub task_id: TaskId,
    pub dependencies: Vec<TaskId>,
    pub policy: DependencyPolicy,
    pub submit_seq: u64,
}

/// Notification from the manager back to the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepEvent {
    /// All dependencies completed; the task may be scheduled
    Ready { task_id: TaskId },
    /// A propagate-policy dependency failed or was cancelled
    DependencyFailed {
        task_id: TaskId,
        failed_dependency: TaskId,
    },
}

#[derive(Debug)]
enum Command {
    Add { nodes: Vec<DepNode> },
    Resolved { task_id: TaskId, outcome: DepOutcome },
}

/// Handle for posting to the dependency manager
#[derive(Clone)]
pub struct DepsHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl DepsHandle {
    /// Inserts a batch of already-validated nodes
    pub fn add(&self, nodes: Vec<DepNode>) {
        let _ = self.tx.send(Command::Add { nodes });
    }

    /// Records a task's terminal outcome
    pub fn resolved(&self, task_id: TaskId, outcome: DepOutcome) {
        let _ = self.tx.send(Command::Resolved { task_id, outcome });
    }
}

struct PendingNode {
    unmet: HashSet<TaskId>,
    policy: DependencyPolicy,
    submit_seq: u64,
}

struct DagState {
    pending: HashMap<TaskId, PendingNode>,
    /// Reverse edges: dependency -> dependents
    dependents: HashMap<TaskId, Vec<TaskId>>,
    /// Tasks promoted but not yet resolved
    live: HashSet<TaskId>,
    /// Terminal outcomes seen so far
    outcomes: HashMap<TaskId, DepOutcome>,
    events: mpsc::UnboundedSender<DepEvent>,
}

impl DagState {
    fn add(&mut self, nodes: Vec<DepNode>) {
        let mut newly_ready: Vec<(u64, TaskId)> = Vec::new();
        let mut failed_at_add: Vec<(TaskId, TaskId)> = Vec::new();

        for node in nodes {
            let mut unmet = HashSet::new();
            let mut dead_dependency = None;
            for dep in &node.dependencies {
                match self.outcomes.get(dep) {
                    Some(outcome) if outcome.satisfies_dependents() => {}
                    Some(_) if node.policy == DependencyPolicy::Tolerate => {}
                    Some(_) => {
                        dead_dependency = Some(*dep);
                        break;
                    }
                    None => {
                        unmet.insert(*dep);
                        self.dependents.entry(*dep).or_default().push(node.task_id);
                    }
                }
            }

            if let Some(dep) = dead_dependency {
                failed_at_add.push((node.task_id, dep));
                continue;
            }

            if unmet.is_empty() {
                self.live.insert(node.task_id);
                newly_ready.push((node.submit_seq, node.task_id));
            } else {
                trace!(task = %node.task_id, unmet = unmet.len(), "task pending on dependencies");
                self.pending.insert(
                    node.task_id,
                    PendingNode {
                        unmet,
                        policy: node.policy,
                        submit_seq: node.submit_seq,
                    },
                );
            }
        }

        newly_ready.sort_unstable();
        for (_, task_id) in newly_ready {
            let _ = self.events.send(DepEvent::Ready { task_id });
        }
        for (task_id, failed_dependency) in failed_at_add {
            let _ = self.events.send(DepEvent::DependencyFailed {
                task_id,
                failed_dependency,
            });
        }
    }

    fn resolved(&mut self, task_id: TaskId, outcome: DepOutcome) {
        self.live.remove(&task_id);
        self.pending.remove(&task_id);
        self.outcomes.insert(task_id, outcome);

        let Some(dependents) = self.dependents.remove(&task_id) else {
            return;
        };

        let mut newly_ready: Vec<(u64, TaskId)> = Vec::new();
        for dependent in dependents {
            let Some(node) = self.pending.get_mut(&dependent) else {
                continue;
            };
            let met = outcome.satisfies_dependents() || node.policy == DependencyPolicy::Tolerate;
            if met {
                node.unmet.remove(&task_id);
                if node.unmet.is_empty() {
                    let node = self.pending.remove(&dependent).expect("node exists");
                    self.live.insert(dependent);
                    newly_ready.push((node.submit_seq, dependent));
                }
            } else {
                self.pending.remove(&dependent);
                let _ = self.events.send(DepEvent::DependencyFailed {
                    task_id: dependent,
                    failed_dependency: task_id,
                });
            }
        }

        // submission order within the batch that just unblocked
        newly_ready.sort_unstable();
        for (_, ready) in newly_ready {
            let _ = self.events.send(DepEvent::Ready { task_id: ready });
        }
    }
}

/// Spawns the DAG owner task
///
/// Returns the command handle and the stream of promotions/propagations the
/// hub consumes.
#[must_use]
pub fn spawn_dependency_manager(
    shutdown: CancellationToken,
) -> (DepsHandle, mpsc::UnboundedReceiver<DepEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut state = DagState {
            pending: HashMap::new(),
            dependents: HashMap::new(),
            live: HashSet::new(),
            outcomes: HashMap::new(),
            events: event_tx,
        };
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(Command::Add { nodes }) => state.add(nodes),
                    Some(Command::Resolved { task_id, outcome }) => {
                        state.resolved(task_id, outcome);
                    }
                    None => break,
                },
            }
        }
        debug!("dependency manager stopped");
    });

    (DepsHandle { tx }, event_rx)
}

/// Detects a dependency cycle inside one workflow batch
///
/// Edges reference positions in the batch. Existing tasks cannot acquire new
/// dependencies, so a cycle can only live inside the batch being submitted.
/// Returns the position of a task on a cycle, if any.
#[must_use]
pub fn find_cycle(edges: &[Vec<usize>]) -> Option<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(node: usize, edges: &[Vec<usize>], marks: &mut [Mark]) -> Option<usize> {
        marks[node] = Mark::Grey;
        for &next in &edges[node] {
            match marks[next] {
                Mark::Grey => return Some(next),
                Mark::White => {
                    if let Some(hit) = visit(next, edges, marks) {
                        return Some(hit);
                    }
                }
                Mark::Black => {}
            }
        }
        marks[node] = Mark::Black;
        None
    }

    let mut marks = vec![Mark::White; edges.len()];
    for node in 0..edges.len() {
        if marks[node] == Mark::White {
            if let Some(hit) = visit(node, edges, &mut marks) {
                return Some(hit);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(task_id: TaskId, deps: Vec<TaskId>, seq: u64) -> DepNode {
        DepNode {
            task_id,
            dependencies: deps,
            policy: DependencyPolicy::Propagate,
            submit_seq: seq,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DepEvent>) -> Vec<DepEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn no_dependency_promotes_immediately() {
        let (handle, mut rx) = spawn_dependency_manager(CancellationToken::new());
        let task = TaskId::generate();
        handle.add(vec![node(task, vec![], 0)]);
        tokio::task::yield_now().await;
        assert_eq!(drain(&mut rx), vec![DepEvent::Ready { task_id: task }]);
    }

    #[tokio::test]
    async fn chain_promotes_in_order() {
        let (handle, mut rx) = spawn_dependency_manager(CancellationToken::new());
        let first = TaskId::generate();
        let second = TaskId::generate();
        let third = TaskId::generate();
        handle.add(vec![
            node(first, vec![], 0),
            node(second, vec![first], 1),
            node(third, vec![second], 2),
        ]);
        tokio::task::yield_now().await;
        assert_eq!(drain(&mut rx), vec![DepEvent::Ready { task_id: first }]);

        handle.resolved(first, DepOutcome::Completed);
        tokio::task::yield_now().await;
        assert_eq!(drain(&mut rx), vec![DepEvent::Ready { task_id: second }]);

        handle.resolved(second, DepOutcome::Completed);
        tokio::task::yield_now().await;
        assert_eq!(drain(&mut rx), vec![DepEvent::Ready { task_id: third }]);
    }

    #[tokio::test]
    async fn fan_in_waits_for_all_and_keeps_submission_order() {
        let (handle, mut rx) = spawn_dependency_manager(CancellationToken::new());
        let left = TaskId::generate();
        let right = TaskId::generate();
        let join_a = TaskId::generate();
        let join_b = TaskId::generate();
        handle.add(vec![
            node(left, vec![], 0),
            node(right, vec![], 1),
            node(join_b, vec![left, right], 3),
            node(join_a, vec![left, right], 2),
        ]);
        tokio::task::yield_now().await;
        drain(&mut rx);

        handle.resolved(left, DepOutcome::Completed);
        tokio::task::yield_now().await;
        assert!(drain(&mut rx).is_empty());

        handle.resolved(right, DepOutcome::Completed);
        tokio::task::yield_now().await;
        assert_eq!(
            drain(&mut rx),
            vec![
                DepEvent::Ready { task_id: join_a },
                DepEvent::Ready { task_id: join_b },
            ]
        );
    }

    #[tokio::test]
    async fn failure_propagates_to_dependents() {
        let (handle, mut rx) = spawn_dependency_manager(CancellationToken::new());
        let root = TaskId::generate();
        let child = TaskId::generate();
        handle.add(vec![node(root, vec![], 0), node(child, vec![root], 1)]);
        tokio::task::yield_now().await;
        drain(&mut rx);

        handle.resolved(root, DepOutcome::Failed);
        tokio::task::yield_now().await;
        assert_eq!(
            drain(&mut rx),
            vec![DepEvent::DependencyFailed {
                task_id: child,
                failed_dependency: root,
            }]
        );
    }

    #[tokio::test]
    async fn cancelled_dependency_propagates_like_failure() {
        let (handle, mut rx) = spawn_dependency_manager(CancellationToken::new());
        let root = TaskId::generate();
        let child = TaskId::generate();
        handle.add(vec![node(root, vec![], 0), node(child, vec![root], 1)]);
        tokio::task::yield_now().await;
        drain(&mut rx);

        handle.resolved(root, DepOutcome::Cancelled);
        tokio::task::yield_now().await;
        assert_eq!(
            drain(&mut rx),
            vec![DepEvent::DependencyFailed {
                task_id: child,
                failed_dependency: root,
            }]
        );
    }

    #[tokio::test]
    async fn tolerate_policy_survives_failed_dependency() {
        let (handle, mut rx) = spawn_dependency_manager(CancellationToken::new());
        let root = TaskId::generate();
        let child = TaskId::generate();
        let mut tolerant = node(child, vec![root], 1);
        tolerant.policy = DependencyPolicy::Tolerate;
        handle.add(vec![node(root, vec![], 0), tolerant]);
        tokio::task::yield_now().await;
        drain(&mut rx);

        handle.resolved(root, DepOutcome::Failed);
        tokio::task::yield_now().await;
        assert_eq!(drain(&mut rx), vec![DepEvent::Ready { task_id: child }]);
    }

    #[tokio::test]
    async fn dependency_on_already_failed_task_fails_at_add() {
        let (handle, mut rx) = spawn_dependency_manager(CancellationToken::new());
        let root = TaskId::generate();
        handle.add(vec![node(root, vec![], 0)]);
        tokio::task::yield_now().await;
        drain(&mut rx);
        handle.resolved(root, DepOutcome::Failed);
        tokio::task::yield_now().await;

        let late = TaskId::generate();
        handle.add(vec![node(late, vec![root], 1)]);
        tokio::task::yield_now().await;
        assert_eq!(
            drain(&mut rx),
            vec![DepEvent::DependencyFailed {
                task_id: late,
                failed_dependency: root,
            }]
        );
    }

    #[test]
    fn cycle_detection_finds_loops() {
        // 0 -> 1 -> 2 -> 0
        assert!(find_cycle(&[vec![1], vec![2], vec![0]]).is_some());
        // self loop
        assert!(find_cycle(&[vec![0]]).is_some());
        // diamond, no cycle
        assert!(find_cycle(&[vec![1, 2], vec![3], vec![3], vec![]]).is_none());
        assert!(find_cycle(&[]).is_none());
    }
}

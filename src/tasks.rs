//! Task and workflow submission types
//!
//! `TaskSpec`/`WorkflowSpec` are the submission surface; `TaskRecord` is the
//! hub-owned state. The wire never sees a record, submitters never hand the
//! hub a record.

use serde::{Deserialize, Serialize};

use crate::domain_types::{
    ActionName, AgentId, AttemptCount, ContextId, MaxRetries, Parallelism, RetryPolicy, TaskFailure,
    TaskId, TaskPriority, TaskState, TaskTimeoutMs,
};

/// What happens to dependents when a dependency fails or is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Dependents fail with `dependency_failed`
    #[default]
    Propagate,
    /// Dependents proceed as if the dependency had completed
    Tolerate,
}

/// How a fan-out task's payload is split across sub-tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    /// List payload distributed by index modulo N
    RoundRobin,
    /// List payload distributed to minimize the maximum bucket weight
    LoadBalanced,
    /// Every sub-task receives the full payload
    Broadcast,
    /// Splitter registered for the task's action
    Custom,
}

/// How sub-task results are combined into the parent result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorKind {
    /// Concatenate list-valued results in sub-task index order
    Concat,
    /// Deep-merge mapping-valued results, last writer wins by index order
    Merge,
    /// First successful sub-task wins; siblings are cancelled
    FirstSuccess,
    /// Reducer registered for the task's action
    Custom,
}

/// Fan-out declaration on a task with `parallelism > 1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutSpec {
    pub strategy: SplitStrategy,
    pub aggregator: AggregatorKind,
}

impl Default for FanoutSpec {
    fn default() -> Self {
        Self {
            strategy: SplitStrategy::RoundRobin,
            aggregator: AggregatorKind::Concat,
        }
    }
}

/// One task inside a workflow submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Name unique within the workflow; dependency edges reference it
    pub name: String,
    pub action: ActionName,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Per-task deadline; hub default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<TaskTimeoutMs>,
    /// Per-task retry limit; hub default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<MaxRetries>,
    /// Names of workflow tasks that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub dependency_policy: DependencyPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<Parallelism>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fanout: Option<FanoutSpec>,
}

/// A set of tasks submitted together under one context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub tasks: Vec<TaskSpec>,
}

/// Reply to a successful submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub context_id: ContextId,
    /// Task ids in submission order
    pub task_ids: Vec<TaskId>,
}

/// Hub-owned state of one task
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub context_id: ContextId,
    pub action: ActionName,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub timeout: TaskTimeoutMs,
    pub retry: RetryPolicy,
    pub attempt: AttemptCount,
    pub dependencies: Vec<TaskId>,
    pub dependency_policy: DependencyPolicy,
    pub parallelism: Parallelism,
    pub fanout: Option<FanoutSpec>,
    pub parent_task_id: Option<TaskId>,
    /// Position among the parent's sub-tasks
    pub fanout_index: Option<usize>,
    pub state: TaskState,
    pub assigned_agent_id: Option<AgentId>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    /// Hub-wide submission sequence; ties in the ready queue preserve it
    pub submit_seq: u64,
}

impl TaskRecord {
    /// Whether this task will fan out when it becomes ready
    #[must_use]
    pub fn is_fanout_parent(&self) -> bool {
        self.parallelism.as_usize() > 1
    }
}

/// Externally visible state of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub context_id: ContextId,
    pub action: ActionName,
    pub state: TaskState,
    pub attempt: AttemptCount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

impl From<&TaskRecord> for TaskStatusView {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.task_id,
            context_id: record.context_id,
            action: record.action.clone(),
            state: record.state,
            attempt: record.attempt,
            assigned_agent_id: record.assigned_agent_id.clone(),
            parent_task_id: record.parent_task_id,
            result: record.result.clone(),
            error: record.error.clone(),
        }
    }
}

/// Externally visible state of one workflow context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextStatusView {
    pub context_id: ContextId,
    pub tasks: Vec<TaskStatusView>,
}

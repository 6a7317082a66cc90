//! Domain types for the coordination hub
//!
//! Strongly-typed domain values shared across the hub. Identifiers, capability
//! names, and every tunable carry their validity invariants in the type so the
//! rest of the code never handles bare primitives.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Stable identifier an agent presents at registration (e.g. `planning-1`)
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct AgentId(String);

/// Unique identifier for a task
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new random task ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier grouping all tasks of one submitted workflow
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ContextId(Uuid);

impl ContextId {
    /// Creates a new random context ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Correlation identifier carried on every wire envelope
///
/// Opaque to the hub; agents choose their own ids for messages they
/// originate, the hub mints UUID-shaped ids for its own.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    /// Creates a new random envelope ID
    #[must_use]
    pub fn generate() -> Self {
        Self::try_new(Uuid::new_v4().to_string()).expect("uuid string is within length bounds")
    }
}

/// Name of an action an agent can perform
///
/// Routing is a table lookup on this string; there is no hard-coded agent
/// type enumeration anywhere in the hub.
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct ActionName(String);

/// Scheduling priority of a task
///
/// Strict ordering: critical beats high beats normal beats low. Within one
/// priority class the ready queue is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
    /// Number of priority classes
    pub const CLASSES: usize = 4;

    /// Index into per-priority structures, highest priority first
    #[must_use]
    pub fn class_index(self) -> usize {
        Self::CLASSES - 1 - self as usize
    }
}

/// Lifecycle state of a task
///
/// `pending -> ready -> dispatched -> terminal`, with `dispatched -> pending`
/// allowed exactly on retry and reassignment. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Dispatched,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    /// Whether this state is absorbing
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// Lifecycle state of a connected agent
///
/// `busy` means at least one task is in flight; `draining` refuses new
/// dispatches while current ones finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Connecting,
    Ready,
    Busy,
    Draining,
    Disconnected,
}

impl AgentStatus {
    /// Whether the transport may deliver envelopes to an agent in this state
    #[must_use]
    pub fn is_reachable(self) -> bool {
        matches!(self, Self::Ready | Self::Busy | Self::Draining)
    }

    /// Whether the dispatcher may assign new tasks to an agent in this state
    #[must_use]
    pub fn accepts_dispatch(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

/// Classification of a terminal task failure, surfaced to submitters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Transient,
    Permanent,
    Timeout,
    AgentUnavailable,
    Cancelled,
    DependencyFailed,
    HostRestart,
}

/// Structured terminal error attached to a failed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Number of dispatch attempts already made for a task
///
/// Starts at zero; incremented exactly once per retry transition.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct AttemptCount(u32);

impl AttemptCount {
    /// The first attempt
    #[must_use]
    pub fn zero() -> Self {
        Self::new(0)
    }

    /// The next attempt number
    #[must_use]
    pub fn increment(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }

    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Per-task deadline in milliseconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 86_400_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 60_000
)]
pub struct TaskTimeoutMs(u64);

impl TaskTimeoutMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Maximum retry attempts after the first dispatch
///
/// Zero is valid: a transient failure on the first attempt is then terminal.
#[nutype(
    validate(less_or_equal = 20),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct MaxRetries(u32);

impl MaxRetries {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Base retry backoff in milliseconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 60_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 250
)]
pub struct BackoffBaseMs(u64);

impl BackoffBaseMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Upper bound on a single retry backoff in milliseconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct BackoffMaxMs(u64);

impl BackoffMaxMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Expected agent heartbeat cadence in milliseconds
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 15_000
)]
pub struct HeartbeatIntervalMs(u64);

impl HeartbeatIntervalMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Silent heartbeat intervals tolerated before the hub pings an agent
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 2
)]
pub struct MissedHeartbeats(u32);

impl MissedHeartbeats {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Capacity of a bounded channel
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 256
)]
pub struct QueueCapacity(usize);

impl QueueCapacity {
    /// Gets the value as usize for use with tokio channels
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Number of dispatcher workers pulling from the ready queue
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 8
)]
pub struct DispatchConcurrency(usize);

impl DispatchConcurrency {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Grace period before a disconnected agent's registration is discarded
#[nutype(
    validate(less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5_000
)]
pub struct ReassignmentGraceMs(u64);

impl ReassignmentGraceMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Fan-out degree of a task
///
/// One means the task is dispatched as-is; greater values split it into that
/// many sub-tasks.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1
)]
pub struct Parallelism(u32);

impl Parallelism {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner() as usize
    }
}

/// Concurrency cap an agent may advertise at registration
///
/// Absent a cap, the hub treats the agent's concurrency as unbounded.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct MaxInFlight(u32);

impl MaxInFlight {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Retry policy resolved for one task (per-task overrides over hub defaults)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: MaxRetries,
    pub base_backoff: BackoffBaseMs,
    pub max_backoff: BackoffMaxMs,
}

impl RetryPolicy {
    /// Backoff before the attempt following `failed_attempt`
    ///
    /// `base * 2^failed_attempt`, saturating, capped at `max_backoff`.
    #[must_use]
    pub fn backoff_after(&self, failed_attempt: AttemptCount) -> Duration {
        let base = self.base_backoff.as_u64();
        let shifted = if failed_attempt.as_u32() >= 63 {
            u64::MAX
        } else {
            base.saturating_mul(1u64 << failed_attempt.as_u32())
        };
        Duration::from_millis(shifted.min(self.max_backoff.as_u64()))
    }

    /// Whether another attempt is allowed after `failed_attempt` failed
    #[must_use]
    pub fn allows_retry_after(&self, failed_attempt: AttemptCount) -> bool {
        failed_attempt.as_u32() < self.max_retries.as_u32()
    }
}

//! Wire protocol between the hub and its agents
//!
//! A single envelope covers all traffic in both directions. Frames are
//! self-describing JSON; the `kind` tag selects the body. The protocol major
//! version travels in the `register` message and incompatible agents are
//! refused at the handshake.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain_types::{
    ActionName, AgentId, AttemptCount, ContextId, EnvelopeId, MaxInFlight, TaskId, TaskPriority,
};

/// Protocol version spoken by this hub
pub const PROTOCOL_VERSION: &str = "1";

/// Errors produced while decoding or validating wire traffic
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {source}")]
    Malformed {
        #[from]
        source: serde_json::Error,
    },

    #[error("incompatible protocol version: agent offered {offered}, hub speaks {PROTOCOL_VERSION}")]
    IncompatibleVersion { offered: String },

    #[error("expected a register frame first, got {got}")]
    RegisterExpected { got: &'static str },

    #[error("frame is not valid UTF-8 text")]
    NonTextFrame,
}

/// Error classification an agent reports on a failed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    Validation,
    Transient,
    Permanent,
    TimeoutAgent,
    Cancelled,
}

impl AgentErrorKind {
    /// Whether the hub may retry a task that failed with this kind
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::TimeoutAgent)
    }
}

/// Agent-reported status carried on a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Ready,
    Draining,
}

/// Task completion percentage
#[nutype(
    validate(less_or_equal = 100),
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
    default = 0
)]
pub struct ProgressPercent(u8);

impl ProgressPercent {
    /// Gets the value as u8
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.into_inner()
    }
}

/// The message envelope used for all hub <-> agent traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame on every connection; also re-sent to expand capabilities
    Register {
        id: EnvelopeId,
        agent_id: AgentId,
        protocol_version: String,
        capabilities: Vec<ActionName>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_in_flight: Option<MaxInFlight>,
    },
    /// Periodic liveness signal; may carry a status update
    Heartbeat {
        id: EnvelopeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<HeartbeatStatus>,
    },
    /// Hub -> agent task dispatch
    Task {
        id: EnvelopeId,
        task_id: TaskId,
        context_id: ContextId,
        action: ActionName,
        payload: serde_json::Value,
        priority: TaskPriority,
        timeout_ms: u64,
        attempt: AttemptCount,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_task_id: Option<TaskId>,
    },
    /// Agent -> hub progress report for an in-flight task
    Progress {
        id: EnvelopeId,
        task_id: TaskId,
        percent: ProgressPercent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },
    /// Agent -> hub successful completion; telemetry is forwarded verbatim
    Result {
        id: EnvelopeId,
        task_id: TaskId,
        outcome: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<serde_json::Value>,
    },
    /// Agent -> hub task failure
    Error {
        id: EnvelopeId,
        task_id: TaskId,
        error_kind: AgentErrorKind,
        message: String,
    },
    /// Hub -> agent best-effort release of a task; no ack is awaited
    Cancel { id: EnvelopeId, task_id: TaskId },
    /// Hub -> agent liveness probe
    Ping { id: EnvelopeId },
    /// Agent -> hub probe reply
    Pong { id: EnvelopeId },
}

impl Envelope {
    /// Correlation id of this envelope
    #[must_use]
    pub fn id(&self) -> &EnvelopeId {
        match self {
            Self::Register { id, .. }
            | Self::Heartbeat { id, .. }
            | Self::Task { id, .. }
            | Self::Progress { id, .. }
            | Self::Result { id, .. }
            | Self::Error { id, .. }
            | Self::Cancel { id, .. }
            | Self::Ping { id }
            | Self::Pong { id } => id,
        }
    }

    /// Tag name of this envelope's kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Task { .. } => "task",
            Self::Progress { .. } => "progress",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Cancel { .. } => "cancel",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }

    /// Serializes the envelope to its wire form
    ///
    /// # Errors
    /// Returns `ProtocolError::Malformed` if serialization fails, which only
    /// happens for non-string JSON map keys in the payload.
    pub fn to_wire(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes an envelope from its wire form
    ///
    /// # Errors
    /// Returns `ProtocolError::Malformed` for invalid JSON or an unknown kind.
    pub fn from_wire(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Checks whether an agent's offered protocol version is compatible
///
/// Compatibility is major-version equality; `"1"` and `"1.2"` both match a
/// hub speaking `"1"`.
#[must_use]
pub fn version_compatible(offered: &str) -> bool {
    let major = |v: &str| v.split('.').next().unwrap_or(v).to_string();
    major(offered) == major(PROTOCOL_VERSION)
}

//! # Conflux
//!
//! Conflux is a coordination hub for a fleet of autonomous worker processes
//! ("agents") that cooperate on multi-step research workflows. The hub
//! accepts bidirectional WebSocket connections from agents, workflow
//! submissions from an API frontend, routes each task to an agent whose
//! declared capabilities match the task's action, enforces timeouts and
//! exponential-backoff retries, tracks inter-task dependencies, and
//! aggregates fan-out results.
//!
//! ## Architecture
//!
//! - **Registry**: authoritative agent map — capabilities, liveness, load
//! - **Transport**: one framed WebSocket channel per agent
//! - **Dispatcher**: strict-priority scheduling with per-task deadlines and
//!   bounded retries
//! - **Dependency manager**: single-owner DAG releasing tasks as their
//!   prerequisites complete
//! - **Fan-out manager**: splits a task into N sub-tasks and folds the
//!   ordered results back together
//! - **Event log**: append-only, total-ordered stream that is the hub's
//!   observable contract
//!
//! A single hub instance is authoritative for the agents connected to it;
//! state is in-memory, with optional event persistence through sinks.

/// HTTP/WS surface: submission routes, agent endpoint, event streaming
pub mod api;
/// Hub configuration profiles, builder, and validation
pub mod config;
/// Dependency DAG manager
pub mod deps;
/// Ready queue, in-flight tracking, timeout and retry handling
pub mod dispatch;
/// Validated domain newtypes and core enums
pub mod domain_types;
/// Append-only structured event log and replay
pub mod events;
/// Fan-out split strategies and aggregators
pub mod fanout;
/// Hub wiring, task table, and submission operations
pub mod hub;
/// Wire protocol envelope and version gate
pub mod protocol;
/// Agent registry: capabilities, liveness, assignment
pub mod registry;
/// Event-log sinks (tracing, SQLite)
pub mod sink;
/// Task and workflow submission types
pub mod tasks;
/// Central deadline queue
pub mod timers;
/// WebSocket agent channel
pub mod transport;

pub use config::{HubConfig, HubConfigBuilder, SinkConfig};
pub use hub::{Hub, HubError, SubmitError};
pub use tasks::{SubmitReceipt, TaskSpec, WorkflowSpec};

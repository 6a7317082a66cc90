//! Event-log sinks
//!
//! Sinks consume the event stream through a broadcast subscription; the hub's
//! own state never depends on them. The tracing sink re-emits events as
//! structured log lines; the SQLite sink persists the stream and, on startup,
//! records a `host_restart` failure for every task the previous run left
//! unfinished. Task state is never recovered from a sink.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SinkConfig;
use crate::domain_types::TaskId;
use crate::events::{Event, EventLevel, EventLog, EventType, replay};

/// Errors produced by event sinks
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// A destination for the event stream
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Consumes one event
    async fn append(&self, event: &Event) -> Result<(), SinkError>;

    /// Name used in operator-facing diagnostics
    fn name(&self) -> &'static str;
}

/// Re-emits every event through `tracing` with structured fields
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn append(&self, event: &Event) -> Result<(), SinkError> {
        let event_type = format!("{:?}", event.event_type);
        let task = event.task_id.map(|t| t.to_string());
        let agent = event.agent_id.as_ref().map(ToString::to_string);
        let context = event.context_id.map(|c| c.to_string());
        match event.level {
            EventLevel::Debug => debug!(
                seq = event.seq,
                event = %event_type,
                task = task.as_deref(),
                agent = agent.as_deref(),
                context = context.as_deref(),
                "hub event"
            ),
            EventLevel::Info => info!(
                seq = event.seq,
                event = %event_type,
                task = task.as_deref(),
                agent = agent.as_deref(),
                context = context.as_deref(),
                "hub event"
            ),
            EventLevel::Warn | EventLevel::Error => warn!(
                seq = event.seq,
                event = %event_type,
                task = task.as_deref(),
                agent = agent.as_deref(),
                context = context.as_deref(),
                "hub event"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Persists the event stream to a SQLite database
///
/// Rows are ordered by rowid across hub runs; `seq` restarts per run.
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    /// Opens (creating if needed) the database and ensures the schema
    ///
    /// # Errors
    /// Returns `SinkError::Database` if the database cannot be opened.
    pub async fn connect(path: &Path) -> Result<Self, SinkError> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS hub_events (
                seq INTEGER NOT NULL,
                wall_ms INTEGER NOT NULL,
                mono_us INTEGER NOT NULL,
                level TEXT NOT NULL,
                component TEXT NOT NULL,
                event_type TEXT NOT NULL,
                task_id TEXT,
                agent_id TEXT,
                context_id TEXT,
                fields TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Marks tasks the previous run left unfinished as failed
    ///
    /// Replays the persisted stream, finds every task whose final replayed
    /// state is non-terminal, and appends a `task_failed` row with kind
    /// `host_restart`. Returns the number of tasks swept.
    ///
    /// # Errors
    /// Returns `SinkError` on database or decoding failure.
    pub async fn sweep_host_restart(&self) -> Result<usize, SinkError> {
        let rows = sqlx::query(
            "SELECT event_type, task_id, fields FROM hub_events
             WHERE task_id IS NOT NULL ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let event_type: String = row.try_get("event_type")?;
            let Ok(event_type) =
                serde_json::from_str::<EventType>(&format!("\"{event_type}\""))
            else {
                continue;
            };
            let task_id: Option<String> = row.try_get("task_id")?;
            let Some(task_id) = task_id.and_then(|t| Uuid::parse_str(&t).ok()) else {
                continue;
            };
            let fields: String = row.try_get("fields")?;
            let fields = serde_json::from_str(&fields).unwrap_or_default();
            events.push(Event {
                seq: 0,
                wall_ms: 0,
                mono_us: 0,
                level: event_type.level(),
                component: crate::events::Component::Hub,
                event_type,
                task_id: Some(TaskId::new(task_id)),
                agent_id: None,
                context_id: None,
                fields,
            });
        }

        let table = replay(&events);
        let mut swept = 0;
        for (task_id, replayed) in table {
            if replayed.state.is_terminal() {
                continue;
            }
            sqlx::query(
                "INSERT INTO hub_events
                 (seq, wall_ms, mono_us, level, component, event_type, task_id, fields)
                 VALUES (0, 0, 0, 'warn', 'hub', 'task_failed', ?1, ?2)",
            )
            .bind(task_id.to_string())
            .bind(r#"{"kind":"host_restart"}"#)
            .execute(&self.pool)
            .await?;
            swept += 1;
        }
        if swept > 0 {
            warn!(swept, "marked unfinished tasks from previous run as failed");
        }
        Ok(swept)
    }

    /// Number of persisted rows, for diagnostics and tests
    ///
    /// # Errors
    /// Returns `SinkError::Database` on query failure.
    pub async fn row_count(&self) -> Result<u64, SinkError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM hub_events")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

#[async_trait]
impl EventSink for SqliteSink {
    async fn append(&self, event: &Event) -> Result<(), SinkError> {
        let level = serde_json::to_string(&event.level)?;
        let component = serde_json::to_string(&event.component)?;
        let event_type = serde_json::to_string(&event.event_type)?;
        let fields = serde_json::to_string(&event.fields)?;
        sqlx::query(
            "INSERT INTO hub_events
             (seq, wall_ms, mono_us, level, component, event_type,
              task_id, agent_id, context_id, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(i64::try_from(event.seq).unwrap_or(i64::MAX))
        .bind(i64::try_from(event.wall_ms).unwrap_or(i64::MAX))
        .bind(i64::try_from(event.mono_us).unwrap_or(i64::MAX))
        .bind(level.trim_matches('"'))
        .bind(component.trim_matches('"'))
        .bind(event_type.trim_matches('"'))
        .bind(event.task_id.map(|t| t.to_string()))
        .bind(event.agent_id.as_ref().map(ToString::to_string))
        .bind(event.context_id.map(|c| c.to_string()))
        .bind(fields)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// Builds sink instances from configuration
///
/// # Errors
/// Returns `SinkError` if a SQLite sink cannot open its database.
pub async fn build_sinks(configs: &[SinkConfig]) -> Result<Vec<Arc<dyn EventSink>>, SinkError> {
    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::with_capacity(configs.len());
    for config in configs {
        match config {
            SinkConfig::Tracing => sinks.push(Arc::new(TracingSink)),
            SinkConfig::Sqlite { path } => {
                let sink = SqliteSink::connect(path).await?;
                sink.sweep_host_restart().await?;
                sinks.push(Arc::new(sink));
            }
        }
    }
    Ok(sinks)
}

/// Feeds a broadcast subscription into the configured sinks until shutdown
///
/// A sink failure is logged and skipped; a lagged subscription drops the
/// missed events and keeps going. Sinks observe the stream, they do not
/// gate it.
pub fn spawn_sink_runner(
    log: &EventLog,
    sinks: Vec<Arc<dyn EventSink>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = log.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => {
                        for sink in &sinks {
                            if let Err(error) = sink.append(&event).await {
                                warn!(sink = sink.name(), %error, "event sink append failed");
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event sink subscription lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("event sink runner stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Component, EventDraft, EventType};

    #[tokio::test]
    async fn sqlite_sink_persists_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let sink = SqliteSink::connect(&path).await.unwrap();

        let log = EventLog::new();
        let task = TaskId::generate();
        let event = log.append(
            EventDraft::new(Component::Dispatcher, EventType::TaskDispatched)
                .task(task)
                .field("attempt", 0),
        );
        sink.append(&event).await.unwrap();
        assert_eq!(sink.row_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn host_restart_sweep_fails_unfinished_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let sink = SqliteSink::connect(&path).await.unwrap();

        let log = EventLog::new();
        let finished = TaskId::generate();
        let unfinished = TaskId::generate();
        for draft in [
            EventDraft::new(Component::Hub, EventType::TaskPending).task(finished),
            EventDraft::new(Component::Dispatcher, EventType::TaskDispatched).task(finished),
            EventDraft::new(Component::Dispatcher, EventType::TaskCompleted).task(finished),
            EventDraft::new(Component::Hub, EventType::TaskPending).task(unfinished),
            EventDraft::new(Component::Dispatcher, EventType::TaskDispatched).task(unfinished),
        ] {
            sink.append(&log.append(draft)).await.unwrap();
        }

        // simulate a restart: a fresh sink over the same database sweeps
        let restarted = SqliteSink::connect(&path).await.unwrap();
        assert_eq!(restarted.sweep_host_restart().await.unwrap(), 1);
        // a second sweep finds nothing to do
        assert_eq!(restarted.sweep_host_restart().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sink_runner_consumes_stream() {
        let log = EventLog::new();
        let shutdown = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(
            SqliteSink::connect(&dir.path().join("events.db"))
                .await
                .unwrap(),
        );
        let runner = spawn_sink_runner(&log, vec![sink.clone()], shutdown.clone());

        log.append(EventDraft::new(Component::Hub, EventType::HubStarted));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(sink.row_count().await.unwrap(), 1);
        shutdown.cancel();
        runner.await.unwrap();
    }
}

//! Submission API surface
//!
//! The hub's control operations are plain methods on [`Hub`]; this module is
//! the thin axum layer over them, plus the agent WebSocket endpoint and the
//! per-context event stream. Terminal task outcomes surface here as
//! structured `{kind, message}` errors; the hub's internal error types never
//! reach the wire.

use axum::Router;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain_types::{ContextId, TaskId};
use crate::hub::Hub;
use crate::tasks::WorkflowSpec;
use crate::transport;

/// Builds the hub's HTTP/WS router
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/ws", get(transport::agent_channel))
        .route("/api/workflows", post(submit_workflow))
        .route("/api/tasks/{task_id}", get(task_status))
        .route("/api/tasks/{task_id}/cancel", post(cancel_task))
        .route("/api/contexts/{context_id}", get(context_status))
        .route("/api/contexts/{context_id}/cancel", post(cancel_context))
        .route("/api/contexts/{context_id}/events", get(context_events))
        .route("/api/agents", get(agents))
        .with_state(hub)
}

/// Binds the listener for the configured address
///
/// # Errors
/// Returns the bind failure; the binary maps it to exit code 69.
pub async fn bind(addr: SocketAddr) -> std::io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

/// Serves the router until the shutdown token fires
///
/// # Errors
/// Returns an error if the server fails while running.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Serialize)]
struct ApiErrorBody {
    kind: &'static str,
    message: String,
}

fn error_response(status: StatusCode, kind: &'static str, message: String) -> Response {
    (
        status,
        axum::Json(ApiError {
            error: ApiErrorBody { kind, message },
        }),
    )
        .into_response()
}

async fn submit_workflow(
    State(hub): State<Arc<Hub>>,
    axum::Json(workflow): axum::Json<WorkflowSpec>,
) -> Response {
    match hub.submit(workflow) {
        Ok(receipt) => (StatusCode::OK, axum::Json(receipt)).into_response(),
        Err(error) => error_response(StatusCode::BAD_REQUEST, "validation", error.to_string()),
    }
}

async fn task_status(State(hub): State<Arc<Hub>>, Path(task_id): Path<Uuid>) -> Response {
    match hub.task_status(TaskId::new(task_id)) {
        Some(view) => axum::Json(view).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("unknown task: {task_id}"),
        ),
    }
}

async fn cancel_task(State(hub): State<Arc<Hub>>, Path(task_id): Path<Uuid>) -> Response {
    if hub.cancel_task(TaskId::new(task_id)) {
        (StatusCode::ACCEPTED, axum::Json(json!({"acknowledged": true}))).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("unknown task: {task_id}"),
        )
    }
}

async fn context_status(State(hub): State<Arc<Hub>>, Path(context_id): Path<Uuid>) -> Response {
    match hub.context_status(ContextId::new(context_id)) {
        Some(view) => axum::Json(view).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("unknown context: {context_id}"),
        ),
    }
}

async fn cancel_context(State(hub): State<Arc<Hub>>, Path(context_id): Path<Uuid>) -> Response {
    if hub.cancel_context(ContextId::new(context_id)) {
        (StatusCode::ACCEPTED, axum::Json(json!({"acknowledged": true}))).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("unknown context: {context_id}"),
        )
    }
}

async fn agents(State(hub): State<Arc<Hub>>) -> Response {
    axum::Json(hub.registry().snapshot_all()).into_response()
}

/// Streams a context's events over a WebSocket until all its tasks are
/// terminal
async fn context_events(
    State(hub): State<Arc<Hub>>,
    Path(context_id): Path<Uuid>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let context_id = ContextId::new(context_id);
    if hub.context_status(context_id).is_none() {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("unknown context: {context_id}"),
        );
    }
    upgrade.on_upgrade(move |mut socket| async move {
        let (history, mut live) = hub.subscribe(context_id);
        let mut last_seq = None;
        for event in history {
            last_seq = Some(event.seq);
            if send_event(&mut socket, &event).await.is_err() {
                return;
            }
        }
        if hub.context_is_terminal(context_id) {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }

        loop {
            match live.recv().await {
                Ok(event) => {
                    if event.context_id != Some(context_id)
                        || last_seq.is_some_and(|seq| event.seq <= seq)
                    {
                        continue;
                    }
                    last_seq = Some(event.seq);
                    if send_event(&mut socket, &event).await.is_err() {
                        return;
                    }
                    if hub.context_is_terminal(context_id) {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(context = %context_id, missed, "event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(context = %context_id, "event stream complete");
        let _ = socket.send(Message::Close(None)).await;
    })
}

async fn send_event(
    socket: &mut axum::extract::ws::WebSocket,
    event: &crate::events::Event,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text.into())).await
}

//! WebSocket agent channel
//!
//! One bidirectional framed channel per agent. The first frame must be
//! `register`; after the handshake a write loop drains the agent's bounded
//! outbound queue, the read loop feeds inbound envelopes to the hub, and a
//! watchdog enforces the heartbeat contract: two silent intervals earn a
//! ping, a missed ping reply earns a disconnect.

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain_types::EnvelopeId;
use crate::hub::Hub;
use crate::protocol::{Envelope, ProtocolError, version_compatible};
use crate::registry::Registration;

/// How long a fresh connection gets to present its `register` frame
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Axum handler upgrading an agent connection
pub async fn agent_channel(State(hub): State<Arc<Hub>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| handle_connection(hub, socket))
}

async fn handle_connection(hub: Arc<Hub>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_envelope(&mut stream)).await;
    let envelope = match first {
        Ok(Some(Ok(envelope))) => envelope,
        Ok(Some(Err(error))) => {
            reject(&mut sink, &error.to_string()).await;
            return;
        }
        Ok(None) => return,
        Err(_) => {
            reject(&mut sink, "no register frame within handshake window").await;
            return;
        }
    };

    let first_kind = envelope.kind();
    let Envelope::Register {
        agent_id,
        protocol_version,
        capabilities,
        max_in_flight,
        ..
    } = envelope
    else {
        let error = ProtocolError::RegisterExpected { got: first_kind };
        reject(&mut sink, &error.to_string()).await;
        return;
    };

    if !version_compatible(&protocol_version) {
        let error = ProtocolError::IncompatibleVersion {
            offered: protocol_version,
        };
        reject(&mut sink, &error.to_string()).await;
        return;
    }

    let queue_size = hub.config().agent_outbound_queue_size.as_usize();
    let (outbound_tx, outbound_rx) = mpsc::channel(queue_size);
    if let Err(error) = hub.registry().register(
        Registration {
            agent_id: agent_id.clone(),
            capabilities,
            max_in_flight,
        },
        outbound_tx,
    ) {
        reject(&mut sink, &error.to_string()).await;
        return;
    }

    info!(agent = %agent_id, "agent channel established");
    let connection = CancellationToken::new();
    let writer = tokio::spawn(write_loop(sink, outbound_rx));
    let watchdog = tokio::spawn(watchdog_loop(
        Arc::clone(&hub),
        agent_id.clone(),
        connection.clone(),
    ));

    loop {
        let frame = tokio::select! {
            () = connection.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match Envelope::from_wire(text.as_str()) {
                Ok(envelope) => hub.handle_agent_envelope(&agent_id, envelope),
                Err(error) => {
                    warn!(agent = %agent_id, %error, "undecodable frame dropped");
                }
            },
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => match Envelope::from_wire(text) {
                    Ok(envelope) => hub.handle_agent_envelope(&agent_id, envelope),
                    Err(error) => {
                        warn!(agent = %agent_id, %error, "undecodable frame dropped");
                    }
                },
                Err(_) => warn!(agent = %agent_id, "non-UTF-8 binary frame dropped"),
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                hub.registry().mark_traffic(&agent_id);
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
        }
    }

    connection.cancel();
    watchdog.abort();
    writer.abort();
    hub.disconnect_agent(&agent_id, "connection closed");
    debug!(agent = %agent_id, "agent channel torn down");
}

/// Reads frames until one parses as an envelope or the stream ends
async fn next_envelope(
    stream: &mut SplitStream<WebSocket>,
) -> Option<Result<Envelope, ProtocolError>> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(Envelope::from_wire(text.as_str())),
            Ok(Message::Binary(data)) => {
                return Some(match std::str::from_utf8(&data) {
                    Ok(text) => Envelope::from_wire(text),
                    Err(_) => Err(ProtocolError::NonTextFrame),
                });
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
    None
}

/// Drains the agent's outbound queue onto the socket, in enqueue order
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        match envelope.to_wire() {
            Ok(text) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(error) => warn!(%error, "outbound envelope not serializable"),
        }
    }
    let _ = sink.close().await;
}

/// Heartbeat enforcement for one agent connection
async fn watchdog_loop(
    hub: Arc<Hub>,
    agent_id: crate::domain_types::AgentId,
    connection: CancellationToken,
) {
    let interval = hub.config().heartbeat_interval_ms.as_duration();
    let tolerated = hub
        .config()
        .missed_heartbeats_before_disconnect
        .as_u32()
        .max(1);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            () = connection.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some((last_traffic, awaiting_pong)) = hub.registry().liveness(&agent_id) else {
            return;
        };
        if awaiting_pong {
            hub.disconnect_agent(&agent_id, "missed ping reply");
            connection.cancel();
            return;
        }
        let silent = last_traffic.elapsed();
        if silent >= interval * tolerated {
            let ping = Envelope::Ping {
                id: EnvelopeId::generate(),
            };
            if hub.registry().send(&agent_id, ping).is_ok() {
                hub.registry().mark_pinged(&agent_id);
                debug!(agent = %agent_id, silent_ms = silent.as_millis() as u64, "liveness ping sent");
            }
        }
    }
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, reason: &str) {
    warn!(reason, "agent connection rejected");
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: reason.to_string().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

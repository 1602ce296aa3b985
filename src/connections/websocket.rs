//! Bidirectional WebSocket transport (`GET /ws`)

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn, Instrument, Level};
use uuid::Uuid;

use super::{
    send_or_cancel, Capabilities, CapabilityRequest, Heartbeat, HeartbeatLoop, SessionGuard,
    SessionState, TransportKind,
};
use crate::error::GatewayError;
use crate::server::{ClientIdentity, Gateway};
use crate::session_span;

/// How long a closing session waits for queued frames to reach the socket
const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub async fn websocket_handler(
    State(gateway): State<Arc<Gateway>>,
    ClientIdentity(client_id): ClientIdentity,
    ws: WebSocketUpgrade,
) -> Result<Response, GatewayError> {
    gateway.limiter.enforce_limits(&client_id).await?;

    let capabilities = Capabilities::negotiate(
        TransportKind::Bidirectional,
        CapabilityRequest::default(),
        &gateway.config.connections,
    );
    // Registered before the upgrade so a refused registration is still an HTTP error;
    // a failed upgrade drops the callback and with it the guard
    let guard = gateway
        .connections
        .register(TransportKind::Bidirectional, &client_id, capabilities)?;

    let span = session_span!(Level::INFO, "websocket", guard.id(), client_id = %client_id);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, gateway, guard).instrument(span)))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>, guard: SessionGuard) {
    let session_id = guard.id();
    let cancel = guard.token();
    let config = &gateway.config.connections;

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(config.channel_capacity);

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let welcome = json!({
        "type": "welcome",
        "session_id": session_id,
        "server_time": Utc::now().to_rfc3339(),
        "capabilities": Capabilities::server(TransportKind::Bidirectional, config),
    });
    if !send_or_cancel(&tx, &cancel, Message::Text(welcome.to_string())).await {
        writer.abort();
        return;
    }
    guard.set_state(SessionState::Established);

    let heartbeats = config.heartbeats_enabled.then(|| {
        let heartbeat = HeartbeatLoop::new(
            gateway.connections.clone(),
            gateway.tracker.clone(),
            session_id,
            Duration::from_secs(config.bidirectional_heartbeat_secs),
            config.usage_every_n_heartbeats,
        );
        tokio::spawn(
            heartbeat
                .run(cancel.clone(), tx.clone(), ping_message)
                .in_current_span(),
        )
    });

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "server shutting down".into(),
                }));
                if tx.try_send(close).is_err() {
                    debug!("Outbound queue full, closing without a close frame");
                }
                break;
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_message(session_id, &text) {
                            let reply = Message::Text(reply.to_string());
                            if !send_or_cancel(&tx, &cancel, reply).await && tx.is_closed() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "WebSocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    guard.set_state(SessionState::Closing);
    cancel.cancel();
    if let Some(task) = heartbeats {
        if let Err(err) = task.await {
            warn!(error = %err, "Heartbeat task panicked");
        }
    }
    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        debug!("Peer stopped reading, dropping queued frames");
        writer.abort();
    }
    debug!("WebSocket closed");
}

fn ping_message(heartbeat: &Heartbeat) -> Message {
    let mut ping = json!({
        "type": "ping",
        "timestamp": heartbeat.timestamp.to_rfc3339(),
        "session_id": heartbeat.session_id,
        "heartbeat": heartbeat.count,
    });
    if let Some(usage) = &heartbeat.usage {
        ping["usage"] = json!(usage);
    }
    Message::Text(ping.to_string())
}

/// Reply for one client text message; `None` when no reply is due
pub fn handle_client_message(session_id: Uuid, text: &str) -> Option<Value> {
    let message: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            return Some(json!({
                "type": "error",
                "message": format!("Invalid JSON: {}", err),
                "session_id": session_id,
            }))
        }
    };

    let kind = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match kind.as_str() {
        "pong" => {
            trace!(session_id = %session_id, "Pong received");
            None
        }
        "subscribe" => Some(json!({
            "type": "subscribed",
            "stream": message.get("stream").cloned().unwrap_or_else(|| json!("usage")),
            "session_id": session_id,
            "timestamp": Utc::now().to_rfc3339(),
        })),
        "echo" => Some(json!({
            "type": "echo_response",
            "original": message,
            "server_time": Utc::now().to_rfc3339(),
        })),
        other => Some(json!({
            "type": "error",
            "message": format!("Unknown message type: {}", other),
            "session_id": session_id,
        })),
    }
}

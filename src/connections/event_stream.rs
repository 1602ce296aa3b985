//! Server-sent event transport (`GET /stream`)
//!
//! The handler admits the client, registers a session and spawns one task that owns the
//! session guard and feeds frames into a channel. The response body is that channel, so
//! a client disconnect drops the receiver, the task's next send fails and the guard is
//! released.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, Instrument, Level};

use super::{
    send_or_cancel, Capabilities, CapabilityRequest, Heartbeat, HeartbeatLoop, SessionGuard,
    SessionState, TransportKind,
};
use crate::error::GatewayError;
use crate::server::{ClientIdentity, Gateway};
use crate::session_span;

/// One event-stream frame
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub event: Option<String>,
    pub payload: Option<Value>,
    /// Comment frames carry no event and are ignored by `EventSource` clients
    pub comment: Option<String>,
}

impl StreamFrame {
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self {
            event: Some(name.into()),
            payload: Some(payload),
            comment: None,
        }
    }

    pub fn comment(text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self {
            event: None,
            payload: None,
            comment: Some(text.replace(['\r', '\n'], " ")),
        }
    }

    pub fn heartbeat(heartbeat: &Heartbeat) -> Self {
        let mut payload = json!({
            "heartbeat": heartbeat.count,
            "server_time": heartbeat.timestamp.to_rfc3339(),
            "active_clients": heartbeat.active_clients,
        });
        if let Some(usage) = &heartbeat.usage {
            payload["usage"] = json!(usage);
        }
        Self::event("heartbeat", payload)
    }

    pub fn into_event(self) -> Event {
        let mut event = Event::default();
        if let Some(comment) = self.comment {
            event = event.comment(comment);
        }
        if let Some(name) = self.event {
            event = event.event(name);
        }
        if let Some(payload) = self.payload {
            event = event.data(payload.to_string());
        }
        event
    }
}

pub async fn event_stream_handler(
    State(gateway): State<Arc<Gateway>>,
    ClientIdentity(client_id): ClientIdentity,
    Query(requested): Query<CapabilityRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    gateway.limiter.enforce_limits(&client_id).await?;

    let config = &gateway.config.connections;
    let capabilities = Capabilities::negotiate(TransportKind::EventStream, requested, config);
    let guard = gateway
        .connections
        .register(TransportKind::EventStream, &client_id, capabilities)?;

    let session_id = guard.id();
    let cancel = guard.token();
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let span = session_span!(Level::INFO, "event_stream", session_id, client_id = %client_id);
    tokio::spawn(run_session(gateway.clone(), guard, tx).instrument(span));

    let stop = async move { cancel.cancelled().await };
    let stream = ReceiverStream::new(rx)
        .map(|frame: StreamFrame| Ok(frame.into_event()))
        .take_until(stop);

    let keep_alive = KeepAlive::new()
        .interval(Duration::from_secs(config.event_stream_heartbeat_secs))
        .text("keep-alive");
    Ok(Sse::new(stream).keep_alive(keep_alive))
}

async fn run_session(gateway: Arc<Gateway>, guard: SessionGuard, tx: mpsc::Sender<StreamFrame>) {
    let session_id = guard.id();
    let cancel = guard.token();
    let config = &gateway.config.connections;

    let negotiated = gateway
        .connections
        .get(session_id)
        .map(|session| session.capabilities);
    let greeting = [
        StreamFrame::comment(format!("connected session={}", session_id)),
        StreamFrame::event(
            "ready",
            json!({
                "session_id": session_id,
                "server_capabilities": Capabilities::server(TransportKind::EventStream, config),
                "capabilities": negotiated,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        ),
    ];
    for frame in greeting {
        if !send_or_cancel(&tx, &cancel, frame).await {
            return;
        }
    }
    guard.set_state(SessionState::Established);

    if config.heartbeats_enabled {
        HeartbeatLoop::new(
            gateway.connections.clone(),
            gateway.tracker.clone(),
            session_id,
            Duration::from_secs(config.event_stream_heartbeat_secs),
            config.usage_every_n_heartbeats,
        )
        .run(cancel.clone(), tx.clone(), StreamFrame::heartbeat)
        .await;
    } else {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tx.closed() => {}
        }
    }

    guard.set_state(SessionState::Closing);
    debug!("Event stream finished");
}

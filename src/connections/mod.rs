//! Connection registry and lifecycle
//!
//! Every long-lived connection (event stream or WebSocket) is registered here for as long
//! as its transport task runs. Registration hands back a [`SessionGuard`]; dropping the guard
//! removes the session, so a session can never outlive the task that owns it.
//!
//! ```text
//! connecting -> established -> heartbeating -> closing -> closed
//! ```
//!
//! Each session gets a child of the registry's root [`CancellationToken`]. Closing one
//! transport cancels only its own token; [`ConnectionRegistry::shutdown`] cancels the root
//! and waits a bounded time for every guard to drop.

pub mod event_stream;
pub mod heartbeat;
pub mod websocket;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::{GatewayError, Result};
use crate::resilience::CircuitState;

pub use heartbeat::{Heartbeat, HeartbeatLoop};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    EventStream,
    Bidirectional,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::EventStream => "event_stream",
            TransportKind::Bidirectional => "bidirectional",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Established,
    Heartbeating,
    Closing,
    Closed,
}

/// What the client asked for when connecting
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CapabilityRequest {
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub multiplexing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub compression: bool,
    pub multiplexing: bool,
    pub heartbeat_interval_secs: u64,
    pub usage_in_heartbeats: bool,
}

impl Capabilities {
    /// Everything the server offers on this transport
    pub fn server(transport: TransportKind, config: &ConnectionConfig) -> Self {
        let heartbeat_interval_secs = match transport {
            TransportKind::EventStream => config.event_stream_heartbeat_secs,
            TransportKind::Bidirectional => config.bidirectional_heartbeat_secs,
        };
        Self {
            compression: transport == TransportKind::EventStream,
            multiplexing: true,
            heartbeat_interval_secs,
            usage_in_heartbeats: config.heartbeats_enabled && config.usage_every_n_heartbeats > 0,
        }
    }

    /// Event streams get the intersection of request and offer; WebSockets run with the
    /// transport defaults
    pub fn negotiate(
        transport: TransportKind,
        requested: CapabilityRequest,
        config: &ConnectionConfig,
    ) -> Self {
        let offered = Self::server(transport, config);
        match transport {
            TransportKind::EventStream => Self {
                compression: offered.compression && requested.compression,
                multiplexing: offered.multiplexing && requested.multiplexing,
                ..offered
            },
            TransportKind::Bidirectional => offered,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSession {
    pub id: Uuid,
    pub transport: TransportKind,
    pub client_id: String,
    pub capabilities: Capabilities,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeats: u64,
    pub state: SessionState,
}

struct SessionEntry {
    session: ConnectionSession,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub sessions_at_start: usize,
    pub forced: usize,
    pub deadline_hit: bool,
    pub elapsed_ms: u64,
}

pub struct ConnectionRegistry {
    sessions: DashMap<Uuid, SessionEntry>,
    root: CancellationToken,
    accepting: AtomicBool,
    count: watch::Sender<usize>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            sessions: DashMap::new(),
            root: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            count,
        }
    }

    /// Register a new session; refused once shutdown has started
    pub fn register(
        self: &Arc<Self>,
        transport: TransportKind,
        client_id: &str,
        capabilities: Capabilities,
    ) -> Result<SessionGuard> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(GatewayError::ServiceUnavailable {
                operation: "connections".to_string(),
                failure_count: 0,
                state: CircuitState::Open,
                retry_after: 5,
            });
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let cancel = self.root.child_token();
        let session = ConnectionSession {
            id,
            transport,
            client_id: client_id.to_string(),
            capabilities,
            created_at: now,
            last_heartbeat: now,
            heartbeats: 0,
            state: SessionState::Connecting,
        };

        self.sessions.insert(
            id,
            SessionEntry {
                session,
                cancel: cancel.clone(),
            },
        );
        self.publish_count();

        info!(
            session_id = %id,
            client_id = %client_id,
            transport = %transport,
            active = self.len(),
            "Connection registered"
        );

        Ok(SessionGuard {
            registry: Arc::clone(self),
            id,
            cancel,
        })
    }

    pub fn set_state(&self, id: Uuid, state: SessionState) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.session.state = state;
        }
    }

    /// Record a heartbeat, returning the session's new heartbeat count
    pub fn mark_heartbeat(&self, id: Uuid) -> Option<u64> {
        let mut entry = self.sessions.get_mut(&id)?;
        let session = &mut entry.session;
        session.heartbeats += 1;
        session.last_heartbeat = Utc::now();
        if session.state == SessionState::Established {
            session.state = SessionState::Heartbeating;
        }
        Some(session.heartbeats)
    }

    /// Remove a session and cancel its token; `false` when it was already gone
    pub fn remove(&self, id: Uuid) -> bool {
        let Some((_, mut entry)) = self.sessions.remove(&id) else {
            return false;
        };
        entry.cancel.cancel();
        entry.session.state = SessionState::Closed;
        self.publish_count();

        let lifetime = Utc::now() - entry.session.created_at;
        info!(
            session_id = %id,
            client_id = %entry.session.client_id,
            transport = %entry.session.transport,
            heartbeats = entry.session.heartbeats,
            duration_secs = lifetime.num_seconds(),
            active = self.len(),
            "Connection closed"
        );
        true
    }

    pub fn get(&self, id: Uuid) -> Option<ConnectionSession> {
        self.sessions.get(&id).map(|entry| entry.session.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn count_by_transport(&self, transport: TransportKind) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.session.transport == transport)
            .count()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Close every session, wait up to `deadline` for transports to finish, then clear
    /// whatever is left
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let started = tokio::time::Instant::now();
        self.accepting.store(false, Ordering::SeqCst);

        let sessions_at_start = self.len();
        info!(sessions = sessions_at_start, "Closing all connections");

        for mut entry in self.sessions.iter_mut() {
            entry.session.state = SessionState::Closing;
        }
        self.root.cancel();

        let mut count = self.count.subscribe();
        let drained = tokio::time::timeout(deadline, count.wait_for(|active| *active == 0))
            .await
            .is_ok();

        let forced = if drained { 0 } else { self.force_clear() };
        if forced > 0 {
            warn!(
                forced,
                deadline_ms = deadline.as_millis() as u64,
                "Shutdown deadline reached, forced connection cleanup"
            );
        }

        let report = ShutdownReport {
            sessions_at_start,
            forced,
            deadline_hit: !drained,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            sessions = report.sessions_at_start,
            forced = report.forced,
            elapsed_ms = report.elapsed_ms,
            "Connection shutdown complete"
        );
        report
    }

    fn force_clear(&self) -> usize {
        let ids: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.remove(*id)).count()
    }

    fn publish_count(&self) {
        self.count.send_replace(self.sessions.len());
    }
}

/// Keeps a session registered; dropping it removes the session
pub struct SessionGuard {
    registry: Arc<ConnectionRegistry>,
    id: Uuid,
    cancel: CancellationToken,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancelled when this session closes or the registry shuts down
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_state(&self, state: SessionState) {
        self.registry.set_state(self.id, state);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.registry.remove(self.id) {
            debug!(session_id = %self.id, "Session guard released");
        }
    }
}

/// Queue one outbound frame unless `cancel` fires first; `false` when it was not queued.
///
/// A reader that stops draining its channel cannot hold a transport task past
/// cancellation.
pub(crate) async fn send_or_cancel<T>(
    tx: &mpsc::Sender<T>,
    cancel: &CancellationToken,
    frame: T,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(frame) => sent.is_ok(),
    }
}

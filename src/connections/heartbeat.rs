//! Per-session heartbeat loop

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{send_or_cancel, ConnectionRegistry};
use crate::models::UsageBrief;
use crate::usage::UsageTracker;

#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub session_id: Uuid,
    pub count: u64,
    pub timestamp: DateTime<Utc>,
    pub active_clients: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageBrief>,
}

pub struct HeartbeatLoop {
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<UsageTracker>,
    session_id: Uuid,
    interval: Duration,
    usage_every: u64,
}

impl HeartbeatLoop {
    /// `usage_every == 0` never attaches usage
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<UsageTracker>,
        session_id: Uuid,
        interval: Duration,
        usage_every: u64,
    ) -> Self {
        Self {
            registry,
            tracker,
            session_id,
            interval,
            usage_every,
        }
    }

    /// Emit one rendered frame per interval until `cancel` fires or the receiver goes away.
    ///
    /// Nothing is sent once the token is cancelled, even if a tick was already being
    /// prepared or is waiting on a full channel.
    pub async fn run<T, F>(self, cancel: CancellationToken, tx: mpsc::Sender<T>, render: F)
    where
        F: Fn(&Heartbeat) -> T,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; the first heartbeat is one interval in
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                _ = ticker.tick() => {}
            }

            let Some(count) = self.registry.mark_heartbeat(self.session_id) else {
                debug!(session_id = %self.session_id, "Session gone, stopping heartbeats");
                break;
            };

            let usage = if self.usage_every > 0 && count % self.usage_every == 0 {
                Some(self.tracker.get_current_usage(false).await.brief())
            } else {
                None
            };

            if cancel.is_cancelled() {
                break;
            }

            let heartbeat = Heartbeat {
                session_id: self.session_id,
                count,
                timestamp: Utc::now(),
                active_clients: self.registry.len(),
                usage,
            };
            trace!(session_id = %self.session_id, count, "Heartbeat");

            if !send_or_cancel(&tx, &cancel, render(&heartbeat)).await {
                break;
            }
        }

        debug!(session_id = %self.session_id, "Heartbeat loop stopped");
    }
}

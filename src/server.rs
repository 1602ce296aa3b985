//! HTTP surface
//!
//! [`Gateway`] owns one instance of every service and is the router state. Routes:
//!
//! | Method | Path | |
//! |--------|------|---|
//! | GET | `/health` | liveness and connection counts |
//! | GET | `/usage` | snapshot, limits, warnings and breaker states |
//! | POST | `/admission/check` | run the limiter for the caller; 429 on denial |
//! | POST | `/usage/record` | report one upstream call's tokens and cost |
//! | GET | `/usage/clients` | client records as an incrementally encoded array |
//! | GET | `/stream` | server-sent events |
//! | GET | `/ws` | WebSocket |
//!
//! The caller is identified by the `x-client-id` header, then the `client_id` query
//! parameter, else `anonymous`.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use axum::async_trait;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connections::event_stream::event_stream_handler;
use crate::connections::websocket::websocket_handler;
use crate::connections::{ConnectionRegistry, ShutdownReport, TransportKind};
use crate::encoder::{accepts_gzip, StreamingEncoder};
use crate::error::GatewayError;
use crate::limiter::{validate_client_id, AdmissionDecision, CostAwareLimiter};
use crate::models::{ApiCallUsage, ClientUsageRecord, CostLimits, UsageSnapshot};
use crate::resilience::CircuitSnapshot;
use crate::usage::UsageTracker;

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const ANONYMOUS_CLIENT: &str = "anonymous";

pub struct Gateway {
    pub config: Config,
    pub tracker: Arc<UsageTracker>,
    pub limiter: Arc<CostAwareLimiter>,
    pub connections: Arc<ConnectionRegistry>,
    pub encoder: StreamingEncoder,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let tracker = UsageTracker::from_config(&config).context("Failed to build usage tracker")?;
        Ok(Self::with_tracker(config, tracker))
    }

    pub fn with_tracker(config: Config, tracker: UsageTracker) -> Arc<Self> {
        let tracker = Arc::new(tracker);
        let limiter = Arc::new(CostAwareLimiter::new(
            tracker.clone(),
            config.limits.clone(),
            config.admission.client_retention_hours,
        ));

        Arc::new(Self {
            encoder: StreamingEncoder::new(config.server.compression_threshold_bytes),
            connections: Arc::new(ConnectionRegistry::new()),
            tracker,
            limiter,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any);

        Router::new()
            .route("/health", get(health))
            .route("/usage", get(get_usage))
            .route("/usage/record", post(record_usage))
            .route("/usage/clients", get(list_clients))
            .route("/admission/check", post(check_admission))
            .route("/stream", get(event_stream_handler))
            .route("/ws", get(websocket_handler))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.clone())
    }

    /// Cancelled when the gateway starts shutting down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop background tasks and close every connection within the configured deadline
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown.cancel();
        self.connections
            .shutdown(self.config.connections.shutdown_deadline())
            .await
    }
}

/// Bind, serve until Ctrl+C or SIGTERM, then shut down gracefully
pub async fn serve(gateway: Arc<Gateway>, bind: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    let local_addr = listener.local_addr()?;

    let sweeper = gateway.limiter.clone().spawn_sweeper(
        std::time::Duration::from_secs(gateway.config.admission.sweep_interval_secs),
        gateway.shutdown_token(),
    );

    info!(
        addr = %local_addr,
        sources = ?gateway.tracker.sources(),
        heartbeats = gateway.config.connections.heartbeats_enabled,
        "Gateway listening"
    );

    let app = gateway.router();
    let signal_gateway = gateway.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            signal_gateway.shutdown().await;
        })
        .await
        .context("Server error")?;

    if let Err(err) = sweeper.await {
        warn!(error = %err, "Client sweeper task failed");
    }
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Caller identity resolved from the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

#[derive(Deserialize)]
struct ClientQuery {
    client_id: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = match parts.headers.get(CLIENT_ID_HEADER) {
            Some(value) => Some(
                value
                    .to_str()
                    .map_err(|_| {
                        GatewayError::Validation(format!("{} is not valid text", CLIENT_ID_HEADER))
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };

        let client_id = from_header
            .or_else(|| {
                Query::<ClientQuery>::try_from_uri(&parts.uri)
                    .ok()
                    .and_then(|Query(query)| query.client_id)
            })
            .unwrap_or_else(|| ANONYMOUS_CLIENT.to_string());

        validate_client_id(&client_id)?;
        Ok(Self(client_id))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Serialization(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = match &self {
            GatewayError::RateLimitExceeded {
                reason,
                message,
                retry_after,
            } => json!({
                "error": self.code(),
                "reason": reason,
                "message": message,
                "retry_after": retry_after,
            }),
            GatewayError::ServiceUnavailable {
                operation,
                failure_count,
                state,
                retry_after,
            } => json!({
                "error": self.code(),
                "message": self.to_string(),
                "operation": operation,
                "failure_count": failure_count,
                "state": state,
                "retry_after": retry_after,
            }),
            _ => json!({
                "error": self.code(),
                "message": self.to_string(),
            }),
        };

        if status.is_server_error() {
            error!(code = self.code(), error = %self, "Request failed");
        } else {
            debug!(code = self.code(), error = %self, "Request rejected");
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

async fn health(State(gateway): State<Arc<Gateway>>) -> Json<serde_json::Value> {
    let connections = &gateway.connections;
    let status = if connections.is_accepting() {
        "ok"
    } else {
        "shutting_down"
    };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "active_connections": connections.len(),
    }))
}

#[derive(Deserialize)]
struct UsageQuery {
    #[serde(default)]
    refresh: bool,
}

#[derive(Serialize)]
struct DerivedMetrics {
    total_tokens: u64,
    cache_efficiency: f64,
    tokens_per_dollar: f64,
    average_cost_per_request: f64,
}

#[derive(Serialize)]
struct ConnectionCounts {
    active: usize,
    event_stream: usize,
    bidirectional: usize,
}

#[derive(Serialize)]
struct UsageResponse<'a> {
    usage: UsageSnapshot,
    derived: DerivedMetrics,
    limits: &'a CostLimits,
    within_limits: bool,
    warnings: Vec<String>,
    breakers: Vec<CircuitSnapshot>,
    connections: ConnectionCounts,
}

async fn get_usage(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<UsageQuery>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let snapshot = gateway.tracker.get_current_usage(query.refresh).await;
    let limits = gateway.limiter.limits();
    let check = snapshot.check_limits(limits.hourly_limit, limits.daily_limit);

    let mut warnings = check.warnings;
    warnings.extend(snapshot.warnings.iter().cloned());

    let connections = &gateway.connections;
    let body = UsageResponse {
        derived: DerivedMetrics {
            total_tokens: snapshot.total_tokens(),
            cache_efficiency: snapshot.cache_efficiency(),
            tokens_per_dollar: snapshot.tokens_per_dollar(),
            average_cost_per_request: snapshot.average_cost_per_request(),
        },
        usage: snapshot,
        limits,
        within_limits: check.within_limits,
        warnings,
        breakers: gateway.tracker.breaker_snapshots(),
        connections: ConnectionCounts {
            active: connections.len(),
            event_stream: connections.count_by_transport(TransportKind::EventStream),
            bidirectional: connections.count_by_transport(TransportKind::Bidirectional),
        },
    };

    let encoded = gateway.encoder.encode(&body, accepts_gzip(&headers))?;
    Ok(encoded.into_response())
}

async fn check_admission(
    State(gateway): State<Arc<Gateway>>,
    ClientIdentity(client_id): ClientIdentity,
) -> Result<Json<AdmissionDecision>, GatewayError> {
    let decision = gateway.limiter.enforce_limits(&client_id).await?;
    Ok(Json(decision))
}

#[derive(Serialize)]
struct RecordResponse {
    recorded: bool,
    client: Option<ClientUsageRecord>,
}

async fn record_usage(
    State(gateway): State<Arc<Gateway>>,
    ClientIdentity(client_id): ClientIdentity,
    Json(call): Json<ApiCallUsage>,
) -> Result<Json<RecordResponse>, GatewayError> {
    if !call.cost.is_finite() || call.cost < 0.0 {
        return Err(GatewayError::Validation(
            "cost must be a non-negative number".to_string(),
        ));
    }

    // Recording needs a snapshot to fold into
    let mut recorded = gateway.tracker.track_api_call(&call).await;
    if !recorded {
        gateway.tracker.get_current_usage(false).await;
        recorded = gateway.tracker.track_api_call(&call).await;
    }
    gateway.limiter.record_client_cost(&client_id, call.cost)?;

    Ok(Json(RecordResponse {
        recorded,
        client: gateway.limiter.client(&client_id),
    }))
}

async fn list_clients(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
    let records = gateway.limiter.clients();
    let items = stream::iter(records.into_iter().map(Ok::<_, Infallible>));
    gateway
        .encoder
        .incremental_response(items, accepts_gzip(&headers))
}

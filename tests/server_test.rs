mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use flate2::read::GzDecoder;
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tower::ServiceExt;

use claude_usage_gateway::Gateway;
use common::*;

async fn send(gateway: &std::sync::Arc<Gateway>, request: Request<Body>) -> Response {
    gateway.router().oneshot(request).await.unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_as(uri: &str, client: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-client-id", client)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let gateway = gateway_with(snapshot_burning(0.0));
    let response = send(&gateway, get("/health")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_connections"], 0);
}

#[tokio::test]
async fn test_admission_denied_over_hourly_limit() {
    let gateway = gateway_with(snapshot_burning(12.0));
    let response = send(&gateway, post_as("/admission/check", "svc-a", json!({}))).await;

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers().get(header::RETRY_AFTER).unwrap(),
        "3600"
    );
    let body = body_json(response).await;
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert_eq!(body["reason"], "hourly_cost_limit");
    assert_eq!(body["retry_after"], 3600);
}

#[tokio::test]
async fn test_admission_allowed() {
    let gateway = gateway_with(snapshot_burning(1.0));
    let response = send(&gateway, post_as("/admission/check", "svc-a", json!({}))).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["usage_source"], "ccusage");
    assert_eq!(gateway.limiter.client("svc-a").unwrap().hour_requests, 1);
}

#[tokio::test]
async fn test_client_id_from_query() {
    let gateway = gateway_with(snapshot_burning(1.0));
    let request = Request::builder()
        .method("POST")
        .uri("/admission/check?client_id=from-query")
        .body(Body::empty())
        .unwrap();
    let response = send(&gateway, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(gateway.limiter.client("from-query").is_some());
}

#[tokio::test]
async fn test_invalid_client_id_is_bad_request() {
    let gateway = gateway_with(snapshot_burning(1.0));
    let response = send(&gateway, post_as("/admission/check", "bad id!", json!({}))).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn test_usage_report() {
    let mut snapshot = snapshot_burning(9.0);
    snapshot.session_cost = 3.0;
    snapshot.session_requests = 6;
    let gateway = gateway_with(snapshot);

    let response = send(&gateway, get("/usage")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());

    let body = body_json(response).await;
    assert_eq!(body["usage"]["source"], "ccusage");
    assert_eq!(body["derived"]["average_cost_per_request"], 0.5);
    assert_eq!(body["limits"]["hourly_limit"], 10.0);
    assert_eq!(body["within_limits"], false);
    assert!(body["warnings"]
        .as_array()
        .unwrap()
        .iter()
        .any(|w| w.as_str().unwrap().contains("Hourly burn rate")));
    assert_eq!(body["connections"]["active"], 0);
}

#[tokio::test]
async fn test_usage_report_is_gzipped_when_accepted() {
    let mut config = test_config();
    config.server.compression_threshold_bytes = 16;
    let tracker = tracker_with(vec![Box::new(StaticProvider::ok(snapshot_burning(1.0)))]);
    let gateway = Gateway::with_tracker(config, tracker);

    let request = Request::builder()
        .uri("/usage")
        .header(header::ACCEPT_ENCODING, "gzip")
        .body(Body::empty())
        .unwrap();
    let response = send(&gateway, request).await;
    assert_eq!(
        response.headers().get(header::CONTENT_ENCODING).unwrap(),
        "gzip"
    );

    let compressed = body_bytes(response).await;
    let mut decoded = String::new();
    GzDecoder::new(&compressed[..])
        .read_to_string(&mut decoded)
        .unwrap();
    let body: Value = serde_json::from_str(&decoded).unwrap();
    assert_eq!(body["usage"]["source"], "ccusage");
}

#[tokio::test]
async fn test_record_usage_and_list_clients() {
    let gateway = gateway_with(snapshot_burning(0.0));

    let call = json!({"input_tokens": 1200, "output_tokens": 300, "cost": 0.25});
    let response = send(&gateway, post_as("/usage/record", "svc-a", call.clone())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["recorded"], true);
    assert_eq!(body["client"]["hour_cost"], 0.25);

    send(&gateway, post_as("/usage/record", "svc-b", call)).await;

    let snapshot = gateway.tracker.peek().await.unwrap();
    assert_eq!(snapshot.session_requests, 2);
    assert_eq!(snapshot.input_tokens, 2400);

    let response = send(&gateway, get("/usage/clients")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let clients = body_json(response).await;
    let ids: Vec<&str> = clients
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["client_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["svc-a", "svc-b"]);
}

#[tokio::test]
async fn test_record_rejects_negative_cost() {
    let gateway = gateway_with(snapshot_burning(0.0));
    let call = json!({"input_tokens": 1, "output_tokens": 1, "cost": -1.0});

    let response = send(&gateway, post_as("/usage/record", "svc-a", call)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(gateway.limiter.client("svc-a").is_none());
}

#[tokio::test]
async fn test_empty_client_list_is_empty_array() {
    let gateway = gateway_with(snapshot_burning(0.0));
    let response = send(&gateway, get("/usage/clients")).await;

    assert_eq!(body_bytes(response).await, b"[]");
}

#[tokio::test]
async fn test_stream_refused_during_shutdown() {
    let gateway = gateway_with(snapshot_burning(0.0));
    gateway.shutdown().await;

    let response = send(&gateway, get("/stream?client_id=late")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());

    let response = send(&gateway, get("/health")).await;
    let body = body_json(response).await;
    assert_eq!(body["status"], "shutting_down");
}

#[tokio::test]
async fn test_stream_denied_over_limit() {
    let gateway = gateway_with(snapshot_burning(12.0));
    let response = send(&gateway, get("/stream")).await;

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(gateway.connections.len(), 0);
}

/// Pulls server-sent events off a response body as `field -> value` maps
struct EventReader {
    body: Body,
    buffer: String,
}

impl EventReader {
    fn new(response: Response) -> Self {
        Self {
            body: response.into_body(),
            buffer: String::new(),
        }
    }

    async fn next(&mut self) -> Option<HashMap<String, String>> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let message: String = self.buffer.drain(..end + 2).collect();
                return Some(parse_event(&message));
            }
            let frame = self.body.frame().await?.unwrap();
            if let Ok(data) = frame.into_data() {
                self.buffer.push_str(std::str::from_utf8(&data).unwrap());
            }
        }
    }

    /// Next message that is not a keep-alive comment
    async fn next_message(&mut self) -> Option<HashMap<String, String>> {
        loop {
            let fields = self.next().await?;
            if fields.get("comment").map(String::as_str) != Some("keep-alive") {
                return Some(fields);
            }
        }
    }
}

fn parse_event(message: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in message.lines().filter(|line| !line.is_empty()) {
        let (key, value) = line.split_once(':').unwrap();
        let key = if key.is_empty() { "comment" } else { key };
        fields.insert(key.to_string(), value.trim().to_string());
    }
    fields
}

#[tokio::test(start_paused = true)]
async fn test_event_stream_frames_in_order() {
    let mut config = test_config();
    config.connections.event_stream_heartbeat_secs = 1;
    config.connections.usage_every_n_heartbeats = 2;
    let tracker = tracker_with(vec![Box::new(StaticProvider::ok(snapshot_burning(0.5)))]);
    let gateway = Gateway::with_tracker(config, tracker);

    let response = send(&gateway, get("/stream?client_id=sse-client&compression=true")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );
    let mut events = EventReader::new(response);

    let greeting = events.next_message().await.unwrap();
    let session_id = greeting["comment"]
        .strip_prefix("connected session=")
        .unwrap()
        .to_string();
    assert!(!greeting.contains_key("event"));

    let ready = events.next_message().await.unwrap();
    assert_eq!(ready["event"], "ready");
    let data: Value = serde_json::from_str(&ready["data"]).unwrap();
    assert_eq!(data["session_id"], session_id);
    assert_eq!(data["server_capabilities"]["heartbeat_interval_secs"], 1);
    assert_eq!(data["capabilities"]["compression"], true);
    assert!(data["timestamp"].is_string());
    assert_eq!(gateway.connections.len(), 1);

    for expected in 1..=2 {
        let beat = events.next_message().await.unwrap();
        assert_eq!(beat["event"], "heartbeat");
        let data: Value = serde_json::from_str(&beat["data"]).unwrap();
        assert_eq!(data["heartbeat"], expected);
        assert_eq!(data["active_clients"], 1);
        assert!(data["server_time"].is_string());
        assert_eq!(data.get("usage").is_some(), expected == 2);
    }

    let report = gateway.shutdown().await;
    assert_eq!(report.sessions_at_start, 1);
    assert_eq!(report.forced, 0);

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while events.next().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "stream should end once the gateway shuts down");
    assert!(gateway.connections.is_empty());
}

async fn next_ws_json<S>(socket: &mut S) -> Value
where
    S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no frame within 5s")
            .expect("socket closed")
            .unwrap();
        if message.is_text() {
            return serde_json::from_str(message.to_text().unwrap()).unwrap();
        }
    }
}

/// Next reply that is not a heartbeat ping; pings seen on the way are kept
async fn next_ws_reply<S>(socket: &mut S, pings: &mut Vec<Value>) -> Value
where
    S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let value = next_ws_json(socket).await;
        if value["type"] == "ping" {
            pings.push(value);
        } else {
            return value;
        }
    }
}

#[tokio::test]
async fn test_websocket_session_over_socket() {
    let mut config = test_config();
    config.connections.bidirectional_heartbeat_secs = 1;
    config.connections.usage_every_n_heartbeats = 1;
    let tracker = tracker_with(vec![Box::new(StaticProvider::ok(snapshot_burning(0.5)))]);
    let gateway = Gateway::with_tracker(config, tracker);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = gateway.router();
    let server = tokio::spawn(async move { axum::serve(listener, router).await });

    let url = format!("ws://{}/ws?client_id=ws-client", addr);
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    let welcome = next_ws_json(&mut socket).await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["capabilities"]["heartbeat_interval_secs"], 1);
    let session_id = welcome["session_id"].as_str().unwrap().to_string();
    assert!(welcome["server_time"].is_string());
    assert_eq!(gateway.connections.len(), 1);

    let mut pings = Vec::new();
    socket
        .send(WsMessage::text(json!({"type": "echo", "payload": 42}).to_string()))
        .await
        .unwrap();
    let echo = next_ws_reply(&mut socket, &mut pings).await;
    assert_eq!(echo["type"], "echo_response");
    assert_eq!(echo["original"]["payload"], 42);

    socket
        .send(WsMessage::text(json!({"type": "subscribe"}).to_string()))
        .await
        .unwrap();
    let subscribed = next_ws_reply(&mut socket, &mut pings).await;
    assert_eq!(subscribed["type"], "subscribed");
    assert_eq!(subscribed["stream"], "usage");
    assert_eq!(subscribed["session_id"], session_id);

    socket
        .send(WsMessage::text(json!({"type": "launch"}).to_string()))
        .await
        .unwrap();
    let unknown = next_ws_reply(&mut socket, &mut pings).await;
    assert_eq!(unknown["type"], "error");
    assert_eq!(unknown["message"], "Unknown message type: launch");

    let ping = match pings.first() {
        Some(ping) => ping.clone(),
        None => next_ws_json(&mut socket).await,
    };
    assert_eq!(ping["type"], "ping");
    assert_eq!(ping["session_id"], session_id);
    assert_eq!(ping["heartbeat"], 1);
    assert_eq!(ping["usage"]["source"], "ccusage");

    let report = gateway.shutdown().await;
    assert_eq!(report.sessions_at_start, 1);
    assert_eq!(report.forced, 0);

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(message) = socket.next().await {
            if let Ok(WsMessage::Close(frame)) = message {
                return frame.map(|frame| u16::from(frame.code));
            }
        }
        None
    })
    .await
    .expect("server should close the socket");
    assert_eq!(closed, Some(1001));
    assert!(gateway.connections.is_empty());

    server.abort();
}

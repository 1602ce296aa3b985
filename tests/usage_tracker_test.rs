mod common;

use chrono::{Duration, SecondsFormat, Utc};
use std::sync::atomic::Ordering;
use tempfile::TempDir;

use claude_usage_gateway::usage::{LocalLogProvider, UsageProvider};
use claude_usage_gateway::{ApiCallUsage, UsageSource};
use common::*;

fn ago(minutes: i64) -> String {
    (Utc::now() - Duration::minutes(minutes)).to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[tokio::test]
async fn test_recorded_calls_add_up() {
    let mut base = snapshot_burning(1.0);
    base.session_cost = 2.0;
    base.session_requests = 4;
    let tracker = tracker_with(vec![Box::new(StaticProvider::ok(base))]);

    tracker.get_current_usage(false).await;

    let calls = [
        ApiCallUsage::new(100, 50, 0.25),
        ApiCallUsage::new(200, 80, 0.5).with_cache(10, 90),
        ApiCallUsage::new(10, 5, 0.125).with_messages(3),
    ];
    for call in &calls {
        assert!(tracker.track_api_call(call).await);
    }

    let snapshot = tracker.peek().await.unwrap();
    assert_eq!(snapshot.session_cost, 2.875);
    assert_eq!(snapshot.session_requests, 7);
    assert_eq!(snapshot.input_tokens, 310);
    assert_eq!(snapshot.output_tokens, 135);
    assert_eq!(snapshot.cache_creation_tokens, 10);
    assert_eq!(snapshot.cache_read_tokens, 90);
    assert_eq!(snapshot.session_messages, 5);
}

#[tokio::test]
async fn test_negative_cost_is_not_recorded() {
    let tracker = tracker_with(vec![Box::new(StaticProvider::ok(snapshot_burning(0.0)))]);
    tracker.get_current_usage(false).await;

    tracker.track_api_call(&ApiCallUsage::new(10, 10, -5.0)).await;
    tracker.track_api_call(&ApiCallUsage::new(10, 10, f64::NAN)).await;

    let snapshot = tracker.peek().await.unwrap();
    assert_eq!(snapshot.session_cost, 0.0);
    assert_eq!(snapshot.session_requests, 2);
}

#[tokio::test]
async fn test_degraded_snapshot_lists_every_failure() {
    let tracker = tracker_with(vec![
        Box::new(StaticProvider::failing(UsageSource::Ccusage)),
        Box::new(StaticProvider::failing(UsageSource::Remote)),
    ]);

    let snapshot = tracker.get_current_usage(false).await;
    assert_eq!(snapshot.source, UsageSource::Degraded);
    assert!(!snapshot.source.is_authoritative());
    assert_eq!(snapshot.session_cost, 0.0);
    assert!(snapshot.warnings.iter().any(|w| w.contains("ccusage")));
    assert!(snapshot.warnings.iter().any(|w| w.contains("remote")));
}

#[tokio::test]
async fn test_cached_snapshot_is_reused() {
    let provider = StaticProvider::ok(snapshot_burning(3.0));
    let calls = provider.calls.clone();
    let tracker = tracker_with(vec![Box::new(provider)]);

    for _ in 0..5 {
        tracker.get_current_usage(false).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_local_logs_feed_the_tracker() {
    let home = TempDir::new().unwrap();
    let content = [
        log_line(&ago(10), "msg_1", "req_1", Some(0.5)),
        log_line(&ago(10), "msg_1", "req_1", Some(0.5)),
        log_line(&ago(30), "msg_2", "req_2", Some(1.5)),
        log_line(&ago(120), "msg_3", "req_3", Some(2.0)),
        "not json at all".to_string(),
    ]
    .join("\n");
    create_test_jsonl(home.path(), "projects/-home-user-app/session.jsonl", &content).unwrap();

    let tracker = tracker_with(vec![
        Box::new(StaticProvider::failing(UsageSource::Ccusage)),
        Box::new(LocalLogProvider::new(home.path(), 5)),
    ]);

    let snapshot = tracker.get_current_usage(false).await;
    assert_eq!(snapshot.source, UsageSource::LocalLogs);
    assert_eq!(snapshot.session_requests, 3);
    assert!((snapshot.session_cost - 4.0).abs() < 1e-9);
    // Only the last hour counts towards the hourly burn rate
    assert!((snapshot.burn_rate_per_hour - 2.0).abs() < 1e-9);
    assert!((snapshot.burn_rate_per_day - 4.0).abs() < 1e-9);
    assert_eq!(snapshot.tokens_per_minute, 3000.0 / 60.0);
}

#[tokio::test]
async fn test_local_logs_read_vm_homes() {
    let home = TempDir::new().unwrap();
    create_test_jsonl(
        home.path(),
        "projects/app/a.jsonl",
        &log_line(&ago(5), "msg_a", "req_a", Some(1.0)),
    )
    .unwrap();
    create_test_jsonl(
        home.path(),
        "vms/build-vm/projects/app/b.jsonl",
        &log_line(&ago(5), "msg_b", "req_b", Some(1.0)),
    )
    .unwrap();

    let provider = LocalLogProvider::new(home.path(), 5);
    let snapshot = provider.fetch().await.unwrap();
    assert_eq!(snapshot.session_requests, 2);
    assert!((snapshot.session_cost - 2.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_missing_claude_home_falls_through_to_degraded() {
    let home = TempDir::new().unwrap();
    let tracker = tracker_with(vec![Box::new(LocalLogProvider::new(
        home.path().join("missing"),
        5,
    ))]);

    let snapshot = tracker.get_current_usage(false).await;
    assert_eq!(snapshot.source, UsageSource::Degraded);
    assert!(snapshot.warnings.iter().any(|w| w.contains("local_logs")));
}

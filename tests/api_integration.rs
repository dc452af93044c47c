//! Integration tests for the control API.
//!
//! Each test spins up an Axum server on a random port and drives it with
//! reqwest.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tokio::net::TcpListener;

use mail_relay::api::control_routes;
use mail_relay::pipeline::{CycleRunner, ForwardDispatcher, RelayMetrics};
use mail_relay::store::RelayStore;
use mail_relay::worker::Scheduler;

use common::{FlakyStore, RecordingSink, ScriptedSource, message, store_with_rules};

struct Harness {
    base: String,
    client: reqwest::Client,
    scheduler: Arc<Scheduler>,
    store: Arc<FlakyStore>,
    sink: Arc<RecordingSink>,
}

/// Start the control API on a random port.
async fn start_server() -> Harness {
    let store = FlakyStore::new(store_with_rules(&[("urgent", "ops@example.com")]).await);
    let source = ScriptedSource::new(vec![
        message("m-1", "urgent - Jane Doe"),
        message("m-2", "misc - nobody"),
    ]);
    let sink = RecordingSink::new();
    let runner = Arc::new(CycleRunner::new(
        store.clone(),
        source,
        ForwardDispatcher::new(sink.clone()),
        Arc::new(RelayMetrics::new()),
        chrono::Duration::hours(1),
    ));
    // Long interval: only explicit runs execute during a test.
    let scheduler = Arc::new(
        Scheduler::new(runner, Duration::from_secs(3600), Duration::from_secs(5)).unwrap(),
    );
    let app = control_routes(Arc::clone(&scheduler), store.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        base: format!("http://127.0.0.1:{port}"),
        client: reqwest::Client::new(),
        scheduler,
        store,
        sink,
    }
}

impl Harness {
    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }
}

#[tokio::test]
async fn health_reports_database_and_scheduler() {
    let h = start_server().await;

    let (status, body) = h.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "ok");
    assert_eq!(body["scheduler"]["running"], false);
    assert_eq!(body["scheduler"]["metrics"]["pull_count"], 0);

    h.store.fail_ping.store(true, Ordering::SeqCst);
    let (status, body) = h.get("/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert!(body["database"].as_str().unwrap().contains("unavailable"));
}

#[tokio::test]
async fn start_stop_round_trip() {
    let h = start_server().await;

    let (status, body) = h.post("/api/scheduler/start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "started");
    assert_eq!(body["scheduler"]["running"], true);
    assert!(body["scheduler"]["next_run"].is_string());

    let (status, body) = h.post("/api/scheduler/start").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already running"));

    let (status, body) = h.get("/api/scheduler/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], true);
    assert_eq!(body["interval_secs"], 3600);

    let (status, body) = h.post("/api/scheduler/stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");
    assert_eq!(body["scheduler"]["running"], false);
    assert!(body["scheduler"]["next_run"].is_null());
    assert!(!h.scheduler.is_running());

    // Stopping twice is harmless.
    let (status, _) = h.post("/api/scheduler/stop").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn manual_run_returns_summary() {
    let h = start_server().await;

    let (status, body) = h.post("/api/scheduler/run").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fetched"], 2);
    assert_eq!(body["matched"], 1);
    assert_eq!(body["forwarded"], 1);
    assert_eq!(body["skipped"], 1);
    assert_eq!(body["aborted"], false);
    assert!(body["duration"].is_u64());

    assert_eq!(h.sink.sent(), vec![("m-1".to_string(), "ops@example.com".to_string())]);
    assert!(h.store.is_processed("m-2").await.unwrap());

    // A manual run leaves the schedule untouched.
    let (_, body) = h.get("/api/scheduler/status").await;
    assert_eq!(body["running"], false);
    assert!(body["last_run"].is_string());
    assert_eq!(body["metrics"]["pull_count"], 1);
    assert_eq!(body["metrics"]["forward_successes"], 1);

    let (_, body) = h.post("/api/scheduler/run").await;
    assert_eq!(body["already_processed"], 2);
    assert_eq!(body["forwarded"], 0);
}

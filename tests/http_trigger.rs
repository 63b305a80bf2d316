//! Integration tests for the HTTP trigger surface.
//!
//! Each test binds an Axum server on a random port over a stub runner and
//! calls it with reqwest.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::timeout;

use dividend_relay::error::DeliveryError;
use dividend_relay::run::{RunData, RunMode, RunOutcome, RunRequest, Runner};
use dividend_relay::server::routes;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Returns a fixed outcome and records every request.
struct StubRunner {
    outcome: RunOutcome,
    requests: Mutex<Vec<RunRequest>>,
    /// When set, `run` signals `started` and waits for `release`.
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
    notification: Result<(), String>,
}

impl StubRunner {
    fn returning(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            requests: Mutex::new(Vec::new()),
            gate: None,
            notification: Ok(()),
        }
    }
}

#[async_trait]
impl Runner for StubRunner {
    async fn run(&self, request: RunRequest) -> RunOutcome {
        self.requests.lock().unwrap().push(request);
        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        self.outcome.clone()
    }

    async fn send_test_notification(&self) -> Result<(), DeliveryError> {
        self.notification.clone().map_err(|reason| DeliveryError::SendFailed {
            channel: "stub".into(),
            reason,
        })
    }
}

fn success() -> RunOutcome {
    RunOutcome::Success {
        data: RunData {
            from: "2026/10/01".into(),
            to: "2026/10/19".into(),
            mode: RunMode::Full,
            record_count: 12,
            delivered: true,
            payload: None,
        },
    }
}

/// Start an Axum server on a random port and return its base URL.
async fn start_server(runner: Arc<StubRunner>) -> String {
    let app = routes(runner);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("http://127.0.0.1:{port}")
}

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Arc::new(StubRunner::returning(success()))).await;
        let body: Value = reqwest::get(format!("{base}/health")).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "dividend-relay");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_passes_dates_and_returns_outcome() {
    timeout(TEST_TIMEOUT, async {
        let runner = Arc::new(StubRunner::returning(success()));
        let base = start_server(runner.clone()).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/api/dividend-webhook"))
            .json(&serde_json::json!({ "from": "2026/10/01", "to": "2026/10/19" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["record_count"], 12);

        let requests = runner.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].from.as_deref(), Some("2026/10/01"));
        assert_eq!(requests[0].to.as_deref(), Some("2026/10/19"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_accepts_empty_body() {
    timeout(TEST_TIMEOUT, async {
        let runner = Arc::new(StubRunner::returning(RunOutcome::NoAction {
            message: "nothing".into(),
        }));
        let base = start_server(runner.clone()).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/api/dividend-webhook"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "no_action");
        assert_eq!(runner.requests.lock().unwrap()[0], RunRequest::default());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_maps_error_outcome_to_500() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Arc::new(StubRunner::returning(RunOutcome::Error {
            error: "Portal rejected the credentials".into(),
            kind: "auth".into(),
        })))
        .await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/api/dividend-webhook"))
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "auth");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_rejects_malformed_body() {
    timeout(TEST_TIMEOUT, async {
        let runner = Arc::new(StubRunner::returning(success()));
        let base = start_server(runner.clone()).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/api/dividend-webhook"))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert!(runner.requests.lock().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn overlapping_trigger_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let runner = Arc::new(StubRunner {
            gate: Some((started.clone(), release.clone())),
            ..StubRunner::returning(success())
        });
        let base = start_server(runner.clone()).await;
        let client = reqwest::Client::new();

        let first = tokio::spawn({
            let client = client.clone();
            let url = format!("{base}/api/dividend-webhook");
            async move { client.post(url).send().await.unwrap().status() }
        });
        started.notified().await;

        let second = client
            .post(format!("{base}/api/dividend-webhook"))
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), 409);

        release.notify_one();
        assert_eq!(first.await.unwrap(), 200);
        assert_eq!(runner.requests.lock().unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn run_keeps_its_slot_after_client_disconnects() {
    timeout(TEST_TIMEOUT, async {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let runner = Arc::new(StubRunner {
            gate: Some((started.clone(), release.clone())),
            ..StubRunner::returning(success())
        });
        let base = start_server(runner.clone()).await;
        let url = format!("{base}/api/dividend-webhook");

        let impatient = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let first = tokio::spawn({
            let url = url.clone();
            async move { impatient.post(url).send().await }
        });
        started.notified().await;
        assert!(first.await.unwrap().is_err(), "client should have given up");

        let client = reqwest::Client::new();
        let second = client.post(&url).send().await.unwrap();
        assert_eq!(second.status(), 409);

        release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let third = tokio::spawn({
            let client = client.clone();
            let url = url.clone();
            async move { client.post(url).send().await.unwrap().status() }
        });
        started.notified().await;
        release.notify_one();
        assert_eq!(third.await.unwrap(), 200);
        assert_eq!(runner.requests.lock().unwrap().len(), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_notification_reports_delivery_result() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Arc::new(StubRunner::returning(success()))).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/api/test-notification"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let failing = Arc::new(StubRunner {
            notification: Err("down".into()),
            ..StubRunner::returning(success())
        });
        let base = start_server(failing).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/api/test-notification"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("down"));
    })
    .await
    .expect("test timed out");
}

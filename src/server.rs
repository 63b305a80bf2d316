//! HTTP trigger surface: health, run trigger, and a test notification.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::run::{RunRequest, Runner};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<dyn Runner>,
    /// Held for the duration of a run; a second trigger gets 409.
    in_flight: Arc<Mutex<()>>,
}

/// Build the router over `runner`.
pub fn routes(runner: Arc<dyn Runner>) -> Router {
    let state = AppState {
        runner,
        in_flight: Arc::new(Mutex::new(())),
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/dividend-webhook", post(dividend_webhook))
        .route("/api/test-notification", post(test_notification))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "dividend-relay"
    }))
}

async fn dividend_webhook(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        match serde_json::from_slice::<RunRequest>(&body) {
            Ok(r) => r,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "status": "error", "error": format!("Invalid request body: {e}") })),
                );
            }
        }
    };

    let Ok(guard) = Arc::clone(&state.in_flight).try_lock_owned() else {
        warn!("Run trigger rejected: a run is already in progress");
        return (
            StatusCode::CONFLICT,
            Json(json!({ "status": "error", "error": "A run is already in progress" })),
        );
    };

    info!(from = ?request.from, to = ?request.to, "Run triggered over HTTP");
    // The run owns the guard and outlives this handler if the client hangs up.
    let runner = Arc::clone(&state.runner);
    let run = tokio::spawn(async move {
        let _guard = guard;
        runner.run(request).await
    });
    let outcome = match run.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "Run task failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "error": format!("Run task failed: {e}") })),
            );
        }
    };
    let status = if outcome.is_error() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    let body = serde_json::to_value(&outcome)
        .unwrap_or_else(|e| json!({ "status": "error", "error": e.to_string() }));
    (status, Json(body))
}

async fn test_notification(State(state): State<AppState>) -> impl IntoResponse {
    match state.runner.send_test_notification().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "success" }))),
        Err(e) => {
            warn!(error = %e, "Test notification failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "error": e.to_string() })),
            )
        }
    }
}

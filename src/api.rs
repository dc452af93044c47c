//! Control HTTP surface: scheduler start/stop/run/status and a health probe.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::SchedulerError;
use crate::store::RelayStore;
use crate::worker::Scheduler;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn RelayStore>,
}

/// Build the control router.
pub fn control_routes(scheduler: Arc<Scheduler>, store: Arc<dyn RelayStore>) -> Router {
    let state = ApiState { scheduler, store };

    Router::new()
        .route("/health", get(health))
        .route("/api/scheduler/start", post(start_scheduler))
        .route("/api/scheduler/stop", post(stop_scheduler))
        .route("/api/scheduler/run", post(run_now))
        .route("/api/scheduler/status", get(scheduler_status))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Control API listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.scheduler.status();
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "database": "ok",
                "scheduler": status,
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Health check: database ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "degraded",
                    "database": e.to_string(),
                    "scheduler": status,
                })),
            )
        }
    }
}

// ── Scheduler control ───────────────────────────────────────────────────

async fn start_scheduler(State(state): State<ApiState>) -> impl IntoResponse {
    match state.scheduler.start() {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "started",
                "scheduler": state.scheduler.status(),
            })),
        ),
        Err(e @ SchedulerError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

async fn stop_scheduler(State(state): State<ApiState>) -> impl IntoResponse {
    state.scheduler.stop().await;
    Json(serde_json::json!({
        "status": "stopped",
        "scheduler": state.scheduler.status(),
    }))
}

async fn run_now(State(state): State<ApiState>) -> impl IntoResponse {
    let summary = state.scheduler.run_once().await;
    Json(summary)
}

async fn scheduler_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.scheduler.status())
}

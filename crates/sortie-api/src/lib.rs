//! HTTP control surface for a running sortie daemon.
//!
//! Built with axum. The CLI talks to these endpoints for `status`,
//! `queue`, `pause`, `resume`, `stop` and `logs`.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sortie_core::scheduler::{QueueStatus, Scheduler};
use sortie_core::task::{IssueNumber, Task};
use sortie_runner::runtime::{UnitHandle, UnitRuntime};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state for API handlers.
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub runtime: Arc<dyn UnitRuntime>,
    /// Cancelling this stops the whole daemon.
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(
        scheduler: Arc<Scheduler>,
        runtime: Arc<dyn UnitRuntime>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            runtime,
            shutdown,
            started_at: Utc::now(),
        }
    }
}

pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/status", get(status))
        .route("/api/v1/queue", get(queue))
        .route("/api/v1/tasks/{id}/logs", get(task_logs))
        .route("/api/v1/pause", post(pause))
        .route("/api/v1/resume", post(resume))
        .route("/api/v1/stop", post(stop))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the API server with a graceful shutdown signal.
///
/// When the token is cancelled, the server stops accepting new connections
/// and finishes in-flight requests.
pub async fn serve_with_shutdown(
    state: Arc<ApiState>,
    bind_addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = api_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "starting control API");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    tracing::info!("control API shut down");
    Ok(())
}

// ─── Error type ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: anyhow::anyhow!(msg.into()),
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": format!("{:#}", self.error) });
        (self.status, Json(body)).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(e: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: e.into(),
        }
    }
}

// ─── Health & Status ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Body of `GET /api/v1/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub queue: QueueStatus,
    pub running_tasks: Vec<Task>,
    /// Most recent finished tasks, newest last.
    pub recent: Vec<Task>,
}

/// Finished tasks shown by `status`.
const RECENT_LIMIT: usize = 10;

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let (queue, snapshot) = state.scheduler.report();
    let skip = snapshot.completed.len().saturating_sub(RECENT_LIMIT);
    Json(StatusResponse {
        started_at: state.started_at,
        queue,
        running_tasks: snapshot.running,
        recent: snapshot.completed.into_iter().skip(skip).collect(),
    })
}

async fn queue(State(state): State<Arc<ApiState>>) -> Json<Vec<Task>> {
    Json(state.scheduler.snapshot().queued)
}

async fn task_logs(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u64>,
) -> Result<String, AppError> {
    let id = IssueNumber(id);
    let container = state
        .scheduler
        .running_tasks()
        .into_iter()
        .find(|t| t.id == id)
        .and_then(|t| t.container_id)
        .ok_or_else(|| AppError::not_found(format!("issue {id} is not running")))?;
    let output = state.runtime.logs(&UnitHandle::new(container)).await?;
    Ok(output)
}

// ─── Control ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    pub message: String,
}

fn control(message: &str) -> Json<ControlResponse> {
    Json(ControlResponse {
        ok: true,
        message: message.to_string(),
    })
}

async fn pause(State(state): State<Arc<ApiState>>) -> Json<ControlResponse> {
    state.scheduler.pause();
    control("paused: running tasks continue, no new tasks start")
}

async fn resume(State(state): State<Arc<ApiState>>) -> Json<ControlResponse> {
    state.scheduler.resume();
    control("resumed")
}

async fn stop(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<ControlResponse>) {
    tracing::info!("stop requested over the control API");
    state.shutdown.cancel();
    (StatusCode::ACCEPTED, control("shutting down"))
}

//! Process endpoints.
//!
//! Called by the fleet manager (start, shutdown), by workers (heartbeat),
//! and by operators (list, get, kill).

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use fleet_id::ProcessId;
use fleet_protocol::problem::ApiError;
use fleet_protocol::process::{ProcessParams, ProcessView, ShutdownResponse, StartProcessResponse};
use tracing::{debug, error};

use crate::manager::ProcessManager;

pub fn routes() -> Router<Arc<ProcessManager>> {
    Router::new()
        .route("/processes", get(list_processes).post(start_process))
        .route("/processes/", get(list_processes).post(start_process))
        .route("/processes/{process_id}", get(get_process))
        .route("/processes/{process_id}/kill", post(kill_process))
        .route("/processes/{process_id}/heartbeat", post(process_heartbeat))
        .route("/shutdown", post(shutdown))
}

fn parse_process_id(raw: &str) -> Result<ProcessId, ApiError> {
    // An unparseable id cannot name a registered process.
    raw.parse().map_err(|_| process_not_found(raw))
}

fn process_not_found(raw: &str) -> ApiError {
    ApiError::not_found("process_not_found", format!("Process {raw} not found"))
}

async fn list_processes(State(manager): State<Arc<ProcessManager>>) -> Json<Vec<ProcessView>> {
    Json(manager.list_processes().await)
}

async fn get_process(
    State(manager): State<Arc<ProcessManager>>,
    Path(process_id): Path<String>,
) -> Result<Json<ProcessView>, ApiError> {
    let id = parse_process_id(&process_id)?;
    manager
        .get_process(id)
        .await
        .map(Json)
        .ok_or_else(|| process_not_found(&process_id))
}

async fn start_process(
    State(manager): State<Arc<ProcessManager>>,
    Json(req): Json<ProcessParams>,
) -> Result<Json<StartProcessResponse>, ApiError> {
    manager.start_process(req.params).await.map(Json).map_err(|e| {
        error!(error = %e, "Failed to launch worker");
        ApiError::internal("launch_failed", e.to_string())
    })
}

async fn kill_process(
    State(manager): State<Arc<ProcessManager>>,
    Path(process_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_process_id(&process_id)?;
    if manager.kill_process(id).await {
        Ok(StatusCode::OK)
    } else {
        Err(process_not_found(&process_id))
    }
}

async fn process_heartbeat(
    State(manager): State<Arc<ProcessManager>>,
    Path(process_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_process_id(&process_id)?;
    if manager.record_heartbeat(id).await {
        debug!(process_id = %id, "Heartbeat received");
        Ok(StatusCode::OK)
    } else {
        Err(process_not_found(&process_id))
    }
}

async fn shutdown(State(manager): State<Arc<ProcessManager>>) -> Json<ShutdownResponse> {
    Json(manager.request_shutdown().await)
}

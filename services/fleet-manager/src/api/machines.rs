//! Machine endpoints.
//!
//! `GET /vms` lists the registry; process managers post their heartbeats to
//! `/vms/{id}/heartbeat`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use fleet_id::MachineId;
use fleet_protocol::fleet::{MachineHeartbeat, MachineView};
use fleet_protocol::problem::ApiError;
use tracing::debug;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/vms", get(list_machines))
        .route("/vms/", get(list_machines))
        .route("/vms/{machine_id}", get(get_machine))
        .route("/vms/{machine_id}/heartbeat", post(machine_heartbeat))
}

fn parse_machine_id(raw: &str) -> Result<MachineId, ApiError> {
    raw.parse().map_err(|_| machine_not_found(raw))
}

fn machine_not_found(raw: &str) -> ApiError {
    ApiError::not_found("machine_not_found", format!("Machine {raw} not found"))
}

async fn list_machines(State(state): State<AppState>) -> Json<Vec<MachineView>> {
    Json(state.fleet().list_machines().await)
}

async fn get_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> Result<Json<MachineView>, ApiError> {
    let id = parse_machine_id(&machine_id)?;
    state
        .fleet()
        .get_machine(id)
        .await
        .map(Json)
        .ok_or_else(|| machine_not_found(&machine_id))
}

/// Stale and ignored heartbeats are still acknowledged with 200.
async fn machine_heartbeat(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Json(heartbeat): Json<MachineHeartbeat>,
) -> Result<StatusCode, ApiError> {
    let id = parse_machine_id(&machine_id)?;
    let outcome = state
        .fleet()
        .receive_heartbeat(id, heartbeat)
        .await
        .map_err(|_| machine_not_found(&machine_id))?;

    debug!(
        machine_id = %id,
        sequence_index = heartbeat.sequence_index,
        outcome = ?outcome,
        "Machine heartbeat"
    );
    Ok(StatusCode::OK)
}

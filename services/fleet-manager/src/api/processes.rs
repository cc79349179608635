//! Process allocation endpoint.

use axum::{extract::State, routing::post, Json, Router};
use fleet_protocol::fleet::AllocateResponse;
use fleet_protocol::process::ProcessParams;
use tracing::warn;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/processes", post(allocate_process))
        .route("/processes/", post(allocate_process))
}

/// Failures are reported in `msg` with a 200 status.
async fn allocate_process(
    State(state): State<AppState>,
    Json(req): Json<ProcessParams>,
) -> Json<AllocateResponse> {
    match state.fleet().allocate(req.params).await {
        Ok(allocation) => Json(AllocateResponse {
            msg: AllocateResponse::OK.to_string(),
            process_id: Some(allocation.process_id),
            machine_id: Some(allocation.machine_id),
        }),
        Err(e) => {
            warn!(error = %e, "Allocation failed");
            Json(AllocateResponse {
                msg: e.to_string(),
                process_id: None,
                machine_id: None,
            })
        }
    }
}

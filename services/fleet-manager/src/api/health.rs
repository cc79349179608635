//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    pub machine_count: usize,
    pub available_count: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let fleet = state.fleet();
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "fleet-manager".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        machine_count: fleet.machine_count().await,
        available_count: fleet.available_count().await,
    })
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

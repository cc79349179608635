//! Health check endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use fleet_protocol::CapacityState;
use serde::{Deserialize, Serialize};

use crate::manager::ProcessManager;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    pub capacity_state: CapacityState,
    pub process_count: usize,
}

pub fn routes() -> Router<Arc<ProcessManager>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
}

async fn healthz(State(manager): State<Arc<ProcessManager>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "process-manager".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        capacity_state: manager.capacity_state().await,
        process_count: manager.process_count().await,
    })
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

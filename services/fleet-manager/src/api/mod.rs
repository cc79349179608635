//! HTTP API handlers and routing.

mod health;
mod machines;
mod processes;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the fleet manager router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(machines::routes())
        .merge(processes::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

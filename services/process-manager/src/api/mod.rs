//! HTTP API handlers and routing.

mod health;
mod processes;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::manager::ProcessManager;

/// Create the process manager router.
pub fn create_router(manager: Arc<ProcessManager>) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(processes::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

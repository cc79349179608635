//! Application state shared across request handlers.

use std::sync::Arc;

use crate::fleet::Fleet;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    fleet: Arc<Fleet>,
}

impl AppState {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { fleet }),
        }
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.inner.fleet
    }
}

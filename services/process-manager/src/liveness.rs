//! Liveness sweep over supervised workers.
//!
//! Runs on a short fixed period and kills workers whose heartbeats stopped.
//! See [`ProcessManager::sweep`] for the thresholds.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::manager::ProcessManager;

#[instrument(skip(manager, shutdown))]
pub async fn run_liveness_loop(
    manager: Arc<ProcessManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = period.as_secs(), "Starting process liveness sweep");

    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let killed = manager.sweep(Utc::now()).await;
                if !killed.is_empty() {
                    info!(killed = killed.len(), "Killed processes with stale heartbeats");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Liveness sweep shutting down");
                    break;
                }
            }
        }
    }
}

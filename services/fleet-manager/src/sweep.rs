//! Periodic machine liveness sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::fleet::Fleet;

pub struct SweepWorker {
    fleet: Arc<Fleet>,
    interval: Duration,
}

impl SweepWorker {
    pub fn new(fleet: Arc<Fleet>, interval: Duration) -> Self {
        Self { fleet, interval }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            max_heartbeat_age_secs = self.fleet.settings().max_machine_heartbeat_age.as_secs(),
            "Starting machine sweep worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = self.fleet.sweep(Utc::now()).await;
                    if !removed.is_empty() {
                        info!(removed = removed.len(), "Sweep removed unresponsive machines");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Machine sweep worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

//! Heartbeat loop for reporting machine capacity to the fleet manager.
//!
//! A heartbeat goes out:
//! - on every tick of the heartbeat interval
//! - immediately when a worker exit changes the machine's capacity
//!
//! Each one carries a fresh sequence index. Failed sends are logged and
//! dropped; the next heartbeat supersedes them. The loop ends for good once
//! the shutdown latch is set.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::FleetManagerClient;
use crate::manager::ProcessManager;

/// Run the heartbeat loop until shutdown latches or the process stops.
pub async fn run_heartbeat_loop(
    client: FleetManagerClient,
    manager: Arc<ProcessManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        machine_id = %client.machine_id(),
        interval_secs = period.as_secs(),
        "Starting heartbeat loop"
    );

    let mut latched = manager.shutdown_latched();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = manager.capacity_changed() => {
                debug!("Capacity changed, sending heartbeat early");
            }
            changed = latched.changed() => {
                if changed.is_err() || *latched.borrow() {
                    info!("Shutdown latched, heartbeat loop stopping");
                    break;
                }
                continue;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
                continue;
            }
        }

        let Some(heartbeat) = manager.next_heartbeat().await else {
            info!("Shutdown latched, heartbeat loop stopping");
            break;
        };

        match client.send_heartbeat(&heartbeat).await {
            Ok(()) => {
                consecutive_failures = 0;
                debug!(
                    sequence_index = heartbeat.sequence_index,
                    capacity_state = %heartbeat.capacity_state,
                    "Heartbeat acknowledged"
                );
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures <= 3 {
                    warn!(error = %e, consecutive_failures, "Heartbeat failed");
                } else {
                    error!(error = %e, consecutive_failures, "Heartbeat failed repeatedly");
                }
            }
        }
    }
}

//! Fleet Process Manager
//!
//! Runs once per machine. Spawns game-server workers on request from the
//! fleet manager and keeps the fleet manager informed of this machine's
//! capacity.
//!
//! ## Architecture
//!
//! - **HTTP API**: start/kill workers, worker heartbeats, shutdown negotiation
//! - **Heartbeat Loop**: reports capacity to the fleet manager
//! - **Liveness Sweep**: kills workers whose heartbeats stopped
//!
//! Logs go to stderr. Stdout carries a single JSON ready line once the
//! listener is bound, which is how a local cloud provider learns the port.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use fleet_process_manager::{
    api, client::FleetManagerClient, config::Config, heartbeat, liveness, CommandLauncher,
    ProcessManager,
};
use fleet_protocol::process::ReadyLine;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    info!("Starting fleet process manager");

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    let listen_addr = listener.local_addr()?;
    let advertise_url = format!("http://{listen_addr}");

    info!(
        machine_id = %config.machine_id,
        fleet_manager_url = %config.fleet_manager_url,
        listen_addr = %listen_addr,
        max_process_count = config.max_process_count,
        worker_path = %config.worker_path.display(),
        "Configuration loaded"
    );

    let manager = ProcessManager::new(
        config.manager_settings(advertise_url),
        Arc::new(CommandLauncher::new(config.worker_path.clone())),
    );
    let client = FleetManagerClient::new(config.fleet_manager_url.clone(), config.machine_id)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat_handle = tokio::spawn(heartbeat::run_heartbeat_loop(
        client,
        Arc::clone(&manager),
        config.heartbeat_interval,
        shutdown_rx.clone(),
    ));

    let liveness_handle = tokio::spawn(liveness::run_liveness_loop(
        Arc::clone(&manager),
        config.process_check_interval,
        shutdown_rx.clone(),
    ));

    let app = api::create_router(Arc::clone(&manager));
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    announce_ready(&ReadyLine {
        ready: true,
        listen_addr,
        machine_id: config.machine_id,
    })?;
    info!(addr = %listen_addr, "Listening for connections");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = heartbeat_handle.await;
    let _ = liveness_handle.await;

    info!("Process manager shutdown complete");
    Ok(())
}

fn announce_ready(line: &ReadyLine) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, line)?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

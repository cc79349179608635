//! Fleet Manager
//!
//! The cluster-wide authority over machines. Places processes on machines
//! with spare capacity, provisions new machines through the cloud provider
//! when none are available, and tears machines down once they are idle or
//! stop heartbeating.
//!
//! ## Architecture
//!
//! - **HTTP API**: process allocation, machine heartbeats, registry listing
//! - **Machine Sweep**: deprovisions machines whose heartbeats stopped
//! - **Cloud Provider**: runs each machine as a local process manager

use std::sync::Arc;

use anyhow::Result;
use fleet_manager::{
    api, config::Config, sweep::SweepWorker, AppState, Fleet, HttpMachineApi,
    LocalProcessProvider,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet manager");

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    let listen_addr = listener.local_addr()?;
    let public_url = config
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{listen_addr}"));

    info!(
        listen_addr = %listen_addr,
        public_url = %public_url,
        pm_path = %config.pm_path.display(),
        machine_check_interval_secs = config.machine_check_interval.as_secs(),
        max_machine_heartbeat_age_secs = config.max_machine_heartbeat_age.as_secs(),
        "Configuration loaded"
    );

    let provider = Arc::new(LocalProcessProvider::new(
        config.pm_path.clone(),
        public_url,
        config.provision_timeout,
    ));
    let machines = Arc::new(HttpMachineApi::new(config.machine_request_timeout)?);
    let fleet = Fleet::new(config.fleet_settings(), provider, machines);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweep_worker = SweepWorker::new(Arc::clone(&fleet), config.machine_check_interval);
    let sweep_shutdown = shutdown_rx.clone();
    let sweep_handle = tokio::spawn(async move {
        sweep_worker.run(sweep_shutdown).await;
    });

    let app = api::create_router(AppState::new(Arc::clone(&fleet)));
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
    let _ = sweep_handle.await;

    // Local machines are children of this process and die with the provider.
    info!(
        machines = fleet.machine_count().await,
        "Fleet manager shutdown complete"
    );
    Ok(())
}

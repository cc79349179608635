//! fleet-sim-worker - stand-in game server
//!
//! Started by a process manager with its process id, the manager's URL, and
//! the allocation params. Heartbeats to the manager until its lifetime runs
//! out or the manager no longer knows it.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_id::ProcessId;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fleet-sim-worker", version, about)]
struct Args {
    /// Id assigned by the process manager.
    #[arg(long)]
    process_id: ProcessId,

    /// Base URL of the process manager.
    #[arg(long)]
    manager_url: String,

    /// Allocation params as JSON.
    #[arg(long, default_value = "null")]
    params: String,

    #[arg(long, env = "FLEET_WORKER_HEARTBEAT_INTERVAL_SECS", default_value_t = 3)]
    heartbeat_interval_secs: u64,

    /// Exit after this many seconds. Runs until killed when unset.
    #[arg(long, env = "FLEET_WORKER_LIFETIME_SECS")]
    lifetime_secs: Option<u64>,
}

/// Why the worker stopped.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    LifetimeElapsed,
    Forgotten,
    Interrupted,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let params: serde_json::Value =
        serde_json::from_str(&args.params).context("--params is not valid JSON")?;
    info!(process_id = %args.process_id, params = %params, "Worker started");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let url = heartbeat_url(&args.manager_url, args.process_id);

    let exit = tokio::select! {
        exit = run(&client, &url, &args) => exit,
        _ = tokio::signal::ctrl_c() => Exit::Interrupted,
    };

    info!(process_id = %args.process_id, reason = ?exit, "Worker exiting");
    Ok(())
}

fn heartbeat_url(manager_url: &str, process_id: ProcessId) -> String {
    format!(
        "{}/processes/{process_id}/heartbeat",
        manager_url.trim_end_matches('/')
    )
}

async fn run(client: &reqwest::Client, url: &str, args: &Args) -> Exit {
    let deadline = args
        .lifetime_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut ticker = interval(Duration::from_secs(args.heartbeat_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Exit::LifetimeElapsed;
        }

        match client.post(url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {
                return Exit::Forgotten;
            }
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, "Heartbeat acknowledged");
            }
            Ok(response) => warn!(status = %response.status(), "Heartbeat rejected"),
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }
    }
}

//! Configuration for the process manager.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_id::MachineId;

use crate::manager::ManagerSettings;

/// Process manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier the fleet manager registered this machine under.
    pub machine_id: MachineId,

    /// Fleet manager base URL.
    pub fleet_manager_url: String,

    /// Address to bind the HTTP API to. Port 0 picks an ephemeral port.
    pub listen_addr: SocketAddr,

    /// Worker executable spawned for every accepted process.
    pub worker_path: PathBuf,

    pub max_process_count: usize,

    pub heartbeat_interval: Duration,

    pub process_check_interval: Duration,

    /// Heartbeat age after which a worker is killed regardless of state.
    pub max_starting_heartbeat_age: Duration,

    /// Heartbeat age after which a running worker is killed.
    pub max_running_heartbeat_age: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Generated ids only make sense for a PM started by hand.
        let machine_id = parse_env::<MachineId>("FLEET_MACHINE_ID")?.unwrap_or_default();

        let fleet_manager_url = std::env::var("FLEET_MANAGER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());

        let listen_addr = parse_env("FLEET_PM_LISTEN_ADDR")?
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));

        let worker_path = std::env::var("FLEET_WORKER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("fleet-sim-worker"));

        let max_process_count = parse_env("FLEET_MAX_PROCESSES")?.unwrap_or(4);
        anyhow::ensure!(max_process_count > 0, "FLEET_MAX_PROCESSES must be at least 1");

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            machine_id,
            fleet_manager_url,
            listen_addr,
            worker_path,
            max_process_count,
            heartbeat_interval: env_secs("FLEET_HEARTBEAT_INTERVAL_SECS", 20)?,
            process_check_interval: env_secs("FLEET_PROCESS_CHECK_INTERVAL_SECS", 5)?,
            max_starting_heartbeat_age: env_secs("FLEET_MAX_STARTING_HEARTBEAT_AGE_SECS", 20)?,
            max_running_heartbeat_age: env_secs("FLEET_MAX_RUNNING_HEARTBEAT_AGE_SECS", 10)?,
            log_level,
        })
    }

    /// Settings for the process registry once the bound address is known.
    pub fn manager_settings(&self, advertise_url: String) -> ManagerSettings {
        ManagerSettings {
            max_process_count: self.max_process_count,
            advertise_url,
            max_starting_heartbeat_age: self.max_starting_heartbeat_age,
            max_running_heartbeat_age: self.max_running_heartbeat_age,
        }
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(None),
    }
}

fn env_secs(name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parse_env(name)?.unwrap_or(default)))
}

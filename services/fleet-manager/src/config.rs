//! Configuration for the fleet manager.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::fleet::FleetSettings;

/// Fleet manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP API to.
    pub listen_addr: SocketAddr,

    /// URL handed to provisioned process managers. Defaults to the bound
    /// address when unset.
    pub public_url: Option<String>,

    /// Process manager executable started for each local machine.
    pub pm_path: PathBuf,

    pub machine_check_interval: Duration,

    pub max_machine_heartbeat_age: Duration,

    /// How long to wait for a new machine's ready handshake.
    pub provision_timeout: Duration,

    /// Timeout for calls to a machine's process manager.
    pub machine_request_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = parse_env("FLEET_LISTEN_ADDR")?
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 3000)));

        let public_url = std::env::var("FLEET_PUBLIC_URL").ok();

        let pm_path = std::env::var("FLEET_PM_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("process-manager"));

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            public_url,
            pm_path,
            machine_check_interval: env_secs("FLEET_MACHINE_CHECK_INTERVAL_SECS", 30)?,
            max_machine_heartbeat_age: env_secs("FLEET_MAX_MACHINE_HEARTBEAT_AGE_SECS", 20)?,
            provision_timeout: env_secs("FLEET_PROVISION_TIMEOUT_SECS", 15)?,
            machine_request_timeout: env_secs("FLEET_MACHINE_REQUEST_TIMEOUT_SECS", 10)?,
            log_level,
        })
    }

    pub fn fleet_settings(&self) -> FleetSettings {
        FleetSettings {
            max_machine_heartbeat_age: self.max_machine_heartbeat_age,
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

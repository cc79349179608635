//! Fleet manager API client for the process manager.

use std::time::Duration;

use anyhow::Result;
use fleet_id::MachineId;
use fleet_protocol::fleet::MachineHeartbeat;
use tracing::debug;

/// Fleet manager API client.
#[derive(Debug, Clone)]
pub struct FleetManagerClient {
    client: reqwest::Client,
    base_url: String,
    machine_id: MachineId,
}

impl FleetManagerClient {
    pub fn new(base_url: impl Into<String>, machine_id: MachineId) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            machine_id,
        })
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    /// Report this machine's capacity.
    pub async fn send_heartbeat(&self, heartbeat: &MachineHeartbeat) -> Result<()> {
        let url = format!("{}/vms/{}/heartbeat", self.base_url, self.machine_id);
        debug!(
            url = %url,
            sequence_index = heartbeat.sequence_index,
            capacity_state = %heartbeat.capacity_state,
            "Sending heartbeat"
        );

        let response = self
            .client
            .post(&url)
            .json(heartbeat)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Heartbeat failed with status: {}", response.status());
        }

        Ok(())
    }
}

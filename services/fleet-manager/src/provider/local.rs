//! Provider that runs each machine as a local process manager subprocess.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::{MachineId, Ulid};
use fleet_protocol::process::ReadyLine;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CloudProvider, ProviderError, ProviderHandle, ProvisionedMachine};

/// Spawns `<program>` per machine and waits for its ready line on stdout.
///
/// The child learns its identity and the fleet manager URL from
/// `FLEET_MACHINE_ID` and `FLEET_MANAGER_URL`, and binds an ephemeral port.
/// Children are killed when the provider is dropped.
pub struct LocalProcessProvider {
    program: PathBuf,
    manager_url: String,
    ready_timeout: Duration,
    children: Mutex<HashMap<ProviderHandle, Child>>,
}

impl LocalProcessProvider {
    pub fn new(
        program: impl Into<PathBuf>,
        manager_url: impl Into<String>,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            manager_url: manager_url.into(),
            ready_timeout,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub async fn machine_count(&self) -> usize {
        self.children.lock().await.len()
    }
}

async fn wait_ready(
    lines: &mut Lines<BufReader<ChildStdout>>,
    machine_id: MachineId,
) -> Result<ReadyLine, ProviderError> {
    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<ReadyLine>(&line) {
            Ok(ready) if ready.ready => {
                if ready.machine_id != machine_id {
                    return Err(ProviderError::Handshake(format!(
                        "expected machine {machine_id}, got {}",
                        ready.machine_id
                    )));
                }
                return Ok(ready);
            }
            _ => debug!(machine_id = %machine_id, line = %line, "Ignoring output before ready"),
        }
    }
    Err(ProviderError::Handshake(
        "process manager exited before becoming ready".to_string(),
    ))
}

#[async_trait]
impl CloudProvider for LocalProcessProvider {
    async fn provision(&self, machine_id: MachineId) -> Result<ProvisionedMachine, ProviderError> {
        let mut child = Command::new(&self.program)
            .env("FLEET_MACHINE_ID", machine_id.to_string())
            .env("FLEET_MANAGER_URL", &self.manager_url)
            .env("FLEET_PM_LISTEN_ADDR", "127.0.0.1:0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Handshake("stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let ready =
            match tokio::time::timeout(self.ready_timeout, wait_ready(&mut lines, machine_id)).await
            {
                Ok(Ok(ready)) => ready,
                Ok(Err(e)) => {
                    let _ = child.kill().await;
                    return Err(e);
                }
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(ProviderError::ReadyTimeout(self.ready_timeout));
                }
            };

        // Keep draining so the child never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(machine_id = %machine_id, line = %line, "Process manager stdout");
            }
        });

        let handle = ProviderHandle::new(format!("local-{}", Ulid::new()));
        let endpoint = format!("http://{}", ready.listen_addr);
        info!(
            machine_id = %machine_id,
            handle = %handle,
            pid = child.id(),
            endpoint = %endpoint,
            "Provisioned local machine"
        );

        self.children.lock().await.insert(handle.clone(), child);
        Ok(ProvisionedMachine { endpoint, handle })
    }

    async fn deprovision(&self, handle: &ProviderHandle) -> Result<(), ProviderError> {
        let child = self.children.lock().await.remove(handle);
        let Some(mut child) = child else {
            return Err(ProviderError::UnknownHandle(handle.clone()));
        };

        if let Err(e) = child.kill().await {
            warn!(handle = %handle, error = %e, "Failed to kill process manager");
            self.children.lock().await.insert(handle.clone(), child);
            return Err(e.into());
        }

        info!(handle = %handle, "Deprovisioned local machine");
        Ok(())
    }
}

//! Cloud provider abstraction.
//!
//! The fleet manager asks a provider for a reachable machine given a
//! logical id, and later hands back the opaque handle to tear it down.
//! Both calls are treated as unreliable.

mod local;
mod mock;

pub use local::LocalProcessProvider;
pub use mock::MockProvider;

use std::time::Duration;

use async_trait::async_trait;
use fleet_id::MachineId;
use thiserror::Error;

/// Opaque provider-side reference to a provisioned machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderHandle(String);

impl ProviderHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }
}

impl std::fmt::Display for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful provisioning call.
#[derive(Debug, Clone)]
pub struct ProvisionedMachine {
    /// Base URL of the machine's process manager.
    pub endpoint: String,
    pub handle: ProviderHandle,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to start machine: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("machine did not become ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("machine handshake failed: {0}")]
    Handshake(String),

    #[error("unknown provider handle: {0}")]
    UnknownHandle(ProviderHandle),

    #[error("provider refused the request: {0}")]
    Refused(String),
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provision a machine registered under `machine_id`.
    async fn provision(&self, machine_id: MachineId) -> Result<ProvisionedMachine, ProviderError>;

    /// Tear down a machine previously returned by [`CloudProvider::provision`].
    async fn deprovision(&self, handle: &ProviderHandle) -> Result<(), ProviderError>;
}

//! Fleet control: allocation, machine heartbeats, and teardown.
//!
//! The registry lock is never held across a provider or PM call. After every
//! such call the machine is looked up again and its state re-checked, since
//! heartbeats, sweeps, and other allocations may have run in between.
//!
//! Allocation is two-phase:
//! 1. Acquire: claim the oldest `Partial` machine (it becomes `Pending`),
//!    or provision a new one that is registered as `Pending`.
//! 2. Delegate: ask the machine's PM to start the process and trust the
//!    reply only if it carries a fresh sequence index.
//!
//! Any failed delegation, a rejection included, quarantines the machine as
//! `RecentLaunchUnknown` until a heartbeat or the sweep resolves it. A
//! rejection with a fresh index still has its sequence index recorded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::{MachineId, ProcessId};
use fleet_protocol::fleet::{MachineHeartbeat, MachineView};
use fleet_protocol::process::StartOutcome;
use fleet_protocol::{CapacityState, MachineState};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{MachineApi, MachineClientError};
use crate::provider::{CloudProvider, ProviderError, ProviderHandle};
use crate::registry::{Machine, Registry};

#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// Heartbeat age after which a machine is torn down.
    pub max_machine_heartbeat_age: Duration,
}

/// A process placed on a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub process_id: ProcessId,
    pub machine_id: MachineId,
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("failed to provision machine: {0}")]
    Provision(#[from] ProviderError),

    #[error("machine {machine_id} rejected the process: {outcome}")]
    Rejected {
        machine_id: MachineId,
        outcome: StartOutcome,
    },

    #[error("machine {0} returned a stale or missing sequence index")]
    StaleResponse(MachineId),

    #[error("machine {0} accepted the process without returning its id")]
    MissingProcessId(MachineId),

    #[error("machine {machine_id} unreachable: {source}")]
    Unreachable {
        machine_id: MachineId,
        #[source]
        source: MachineClientError,
    },

    #[error("machine {0} left the registry during allocation")]
    Vanished(MachineId),
}

#[derive(Debug, Error)]
#[error("machine {0} not found")]
pub struct UnknownMachine(pub MachineId);

/// What a machine heartbeat did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The machine is `Pending` or `ShuttingDown`; the FM owns its state.
    Ignored,
    /// The sequence index was not newer than the stored one.
    Stale,
    /// The reported state was applied.
    Applied(MachineState),
    /// The machine reported `Empty` and shutdown negotiation began.
    ShutdownStarted,
}

/// The fleet manager's control object.
pub struct Fleet {
    settings: FleetSettings,
    provider: Arc<dyn CloudProvider>,
    machines: Arc<dyn MachineApi>,
    registry: Mutex<Registry>,
}

impl Fleet {
    pub fn new(
        settings: FleetSettings,
        provider: Arc<dyn CloudProvider>,
        machines: Arc<dyn MachineApi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            provider,
            machines,
            registry: Mutex::new(Registry::new()),
        })
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    pub async fn list_machines(&self) -> Vec<MachineView> {
        self.registry.lock().await.views()
    }

    pub async fn get_machine(&self, id: MachineId) -> Option<MachineView> {
        self.registry.lock().await.get(id).map(Machine::view)
    }

    pub async fn machine_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub async fn available_count(&self) -> usize {
        self.registry.lock().await.available_count()
    }

    /// Place a process with `params` somewhere in the fleet.
    #[instrument(skip(self, params))]
    pub async fn allocate(
        &self,
        params: serde_json::Value,
    ) -> Result<Allocation, AllocationError> {
        let (machine_id, endpoint) = self.acquire().await?;

        let result = self.machines.start_process(&endpoint, &params).await;

        let mut registry = self.registry.lock().await;
        if registry.state(machine_id) != Some(MachineState::Pending) {
            warn!(machine_id = %machine_id, "Machine changed hands during allocation");
            return Err(AllocationError::Vanished(machine_id));
        }

        let response = match result {
            Ok(response) => response,
            Err(source) => {
                warn!(machine_id = %machine_id, error = %source, "Start request failed, quarantining machine");
                registry.set_state(machine_id, MachineState::RecentLaunchUnknown);
                return Err(AllocationError::Unreachable { machine_id, source });
            }
        };

        let fresh = response
            .sequence_index
            .is_some_and(|index| registry.accept_sequence(machine_id, index));
        if !fresh {
            warn!(
                machine_id = %machine_id,
                sequence_index = ?response.sequence_index,
                "Untrusted start response, quarantining machine"
            );
            registry.set_state(machine_id, MachineState::RecentLaunchUnknown);
            return Err(AllocationError::StaleResponse(machine_id));
        }

        registry.set_state(machine_id, response.capacity_state.into());

        match (response.msg, response.process_id) {
            (StartOutcome::Ok, Some(process_id)) => {
                info!(
                    machine_id = %machine_id,
                    process_id = %process_id,
                    capacity_state = %response.capacity_state,
                    "Process allocated"
                );
                Ok(Allocation {
                    process_id,
                    machine_id,
                })
            }
            (StartOutcome::Ok, None) => {
                registry.set_state(machine_id, MachineState::RecentLaunchUnknown);
                Err(AllocationError::MissingProcessId(machine_id))
            }
            (outcome, _) => {
                info!(
                    machine_id = %machine_id,
                    outcome = %outcome,
                    capacity_state = %response.capacity_state,
                    "Machine rejected the process, quarantining machine"
                );
                registry.set_state(machine_id, MachineState::RecentLaunchUnknown);
                Err(AllocationError::Rejected {
                    machine_id,
                    outcome,
                })
            }
        }
    }

    /// Reserve a machine for one allocation. The machine is `Pending` on return.
    async fn acquire(&self) -> Result<(MachineId, String), AllocationError> {
        let claimed = {
            let mut registry = self.registry.lock().await;
            registry
                .claim_available()
                .map(|machine| (machine.id, machine.endpoint.clone()))
        };
        if let Some((machine_id, endpoint)) = claimed {
            debug!(machine_id = %machine_id, "Claimed machine from pool");
            return Ok((machine_id, endpoint));
        }

        let machine_id = MachineId::new();
        info!(machine_id = %machine_id, "No available machine, provisioning");
        let provisioned = self.provider.provision(machine_id).await.map_err(|e| {
            error!(machine_id = %machine_id, error = %e, "Provisioning failed");
            e
        })?;

        let endpoint = provisioned.endpoint.clone();
        self.registry.lock().await.insert(Machine::pending(
            machine_id,
            provisioned.endpoint,
            provisioned.handle,
            Utc::now(),
        ));
        Ok((machine_id, endpoint))
    }

    /// Apply a heartbeat from a machine's PM.
    ///
    /// An `Empty` report starts shutdown negotiation in the background; the
    /// heartbeat is acknowledged without waiting for it.
    pub async fn receive_heartbeat(
        self: &Arc<Self>,
        machine_id: MachineId,
        heartbeat: MachineHeartbeat,
    ) -> Result<HeartbeatOutcome, UnknownMachine> {
        let mut registry = self.registry.lock().await;
        let state = registry
            .state(machine_id)
            .ok_or(UnknownMachine(machine_id))?;

        if state.is_locally_authoritative() {
            debug!(machine_id = %machine_id, state = %state, "Heartbeat ignored");
            return Ok(HeartbeatOutcome::Ignored);
        }
        if !registry.accept_sequence(machine_id, heartbeat.sequence_index) {
            debug!(
                machine_id = %machine_id,
                sequence_index = heartbeat.sequence_index,
                "Stale heartbeat dropped"
            );
            return Ok(HeartbeatOutcome::Stale);
        }
        registry.touch(machine_id, Utc::now());

        if heartbeat.capacity_state == CapacityState::Empty {
            registry.set_state(machine_id, MachineState::ShuttingDown);
            drop(registry);

            info!(machine_id = %machine_id, "Machine is empty, negotiating shutdown");
            let fleet = Arc::clone(self);
            tokio::spawn(async move { fleet.negotiate_shutdown(machine_id).await });
            return Ok(HeartbeatOutcome::ShutdownStarted);
        }

        let next = MachineState::from(heartbeat.capacity_state);
        registry.set_state(machine_id, next);
        if state != next {
            debug!(machine_id = %machine_id, from = %state, to = %next, "Machine state changed");
        }
        Ok(HeartbeatOutcome::Applied(next))
    }

    /// Ask an idle machine's PM to shut down and deprovision it if it agrees.
    ///
    /// The machine must already be `ShuttingDown`.
    pub async fn negotiate_shutdown(&self, machine_id: MachineId) {
        let endpoint = {
            let registry = self.registry.lock().await;
            match registry.get(machine_id) {
                Some(machine) if machine.state() == MachineState::ShuttingDown => {
                    machine.endpoint.clone()
                }
                _ => return,
            }
        };

        match self.machines.request_shutdown(&endpoint).await {
            Ok(response) if response.accepted() => {
                self.teardown(machine_id).await;
            }
            Ok(response) => {
                info!(
                    machine_id = %machine_id,
                    capacity_state = %response.capacity_state,
                    "Machine refused shutdown"
                );
                let mut registry = self.registry.lock().await;
                if registry.state(machine_id) == Some(MachineState::ShuttingDown) {
                    registry.set_state(machine_id, response.capacity_state.into());
                }
            }
            Err(e) => {
                warn!(machine_id = %machine_id, error = %e, "Shutdown request failed, quarantining machine");
                let mut registry = self.registry.lock().await;
                if registry.state(machine_id) == Some(MachineState::ShuttingDown) {
                    registry.set_state(machine_id, MachineState::RecentLaunchUnknown);
                }
            }
        }
    }

    /// Deprovision a machine and forget it. On failure it stays registered
    /// as `ShuttingDown` and the next sweep retries.
    async fn teardown(&self, machine_id: MachineId) -> bool {
        let handle: ProviderHandle = {
            let mut registry = self.registry.lock().await;
            let Some(machine) = registry.get(machine_id) else {
                return false;
            };
            let handle = machine.handle.clone();
            registry.set_state(machine_id, MachineState::ShuttingDown);
            handle
        };

        match self.provider.deprovision(&handle).await {
            Ok(()) => {
                self.registry.lock().await.remove(machine_id);
                info!(machine_id = %machine_id, handle = %handle, "Machine deprovisioned");
                true
            }
            Err(e) => {
                warn!(
                    machine_id = %machine_id,
                    handle = %handle,
                    error = %e,
                    "Deprovisioning failed, will retry on next sweep"
                );
                false
            }
        }
    }

    /// Tear down every machine whose heartbeat is too old, without asking
    /// its PM. Returns the machines that were removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<MachineId> {
        let expired = self
            .registry
            .lock()
            .await
            .expired(now, self.settings.max_machine_heartbeat_age);

        let mut removed = Vec::new();
        for machine_id in expired {
            warn!(machine_id = %machine_id, "Machine heartbeat timed out, tearing down");
            if self.teardown(machine_id).await {
                removed.push(machine_id);
            }
        }
        removed
    }

    #[cfg(test)]
    pub(crate) async fn pool_is_consistent(&self) -> bool {
        self.registry.lock().await.pool_is_consistent()
    }

    #[cfg(test)]
    pub(crate) async fn force_state(&self, machine_id: MachineId, state: MachineState) {
        self.registry.lock().await.set_state(machine_id, state);
    }
}

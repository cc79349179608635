//! Machine registry and the available pool.
//!
//! A machine is in the pool iff its state is `Partial`. Every state change
//! goes through [`Registry::set_state`], which is the only place pool
//! membership is touched.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fleet_id::MachineId;
use fleet_protocol::fleet::MachineView;
use fleet_protocol::MachineState;

use crate::provider::ProviderHandle;

/// A provisioned machine as tracked by the fleet manager.
#[derive(Debug, Clone)]
pub struct Machine {
    pub id: MachineId,
    /// Base URL of the machine's process manager.
    pub endpoint: String,
    pub handle: ProviderHandle,
    state: MachineState,
    last_sequence_index: u64,
    last_heartbeat_at: DateTime<Utc>,
}

impl Machine {
    /// A freshly provisioned machine. Starts `Pending` with sequence 0.
    pub fn pending(
        id: MachineId,
        endpoint: String,
        handle: ProviderHandle,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            endpoint,
            handle,
            state: MachineState::Pending,
            last_sequence_index: 0,
            last_heartbeat_at: now,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn last_sequence_index(&self) -> u64 {
        self.last_sequence_index
    }

    pub fn view(&self) -> MachineView {
        MachineView {
            id: self.id,
            endpoint: self.endpoint.clone(),
            cloud_provider_handle: self.handle.to_string(),
            capacity_state: self.state,
            last_sequence_index: self.last_sequence_index,
            last_heartbeat_at: self.last_heartbeat_at,
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    machines: HashMap<MachineId, Machine>,
    /// Ordered by id, so the oldest partial machine is handed out first.
    available: BTreeSet<MachineId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, machine: Machine) {
        let id = machine.id;
        let state = machine.state;
        self.machines.insert(id, machine);
        self.sync_pool(id, state);
    }

    pub fn get(&self, id: MachineId) -> Option<&Machine> {
        self.machines.get(&id)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn state(&self, id: MachineId) -> Option<MachineState> {
        self.machines.get(&id).map(|m| m.state)
    }

    /// Set a machine's state and keep pool membership in step.
    ///
    /// Returns the previous state, or `None` for an unknown machine.
    pub fn set_state(&mut self, id: MachineId, state: MachineState) -> Option<MachineState> {
        let machine = self.machines.get_mut(&id)?;
        let previous = std::mem::replace(&mut machine.state, state);
        self.sync_pool(id, state);
        Some(previous)
    }

    /// Take the oldest pool member and mark it `Pending`.
    pub fn claim_available(&mut self) -> Option<&Machine> {
        let id = self.available.first().copied()?;
        self.set_state(id, MachineState::Pending);
        self.machines.get(&id)
    }

    /// Store `sequence_index` if it is newer than the stored one.
    ///
    /// Returns false for stale indexes and unknown machines.
    pub fn accept_sequence(&mut self, id: MachineId, sequence_index: u64) -> bool {
        match self.machines.get_mut(&id) {
            Some(machine) if sequence_index > machine.last_sequence_index => {
                machine.last_sequence_index = sequence_index;
                true
            }
            _ => false,
        }
    }

    pub fn touch(&mut self, id: MachineId, now: DateTime<Utc>) {
        if let Some(machine) = self.machines.get_mut(&id) {
            machine.last_heartbeat_at = now;
        }
    }

    pub fn remove(&mut self, id: MachineId) -> Option<Machine> {
        self.available.remove(&id);
        self.machines.remove(&id)
    }

    /// Machines, other than `Pending` ones, whose last heartbeat is older
    /// than `max_age`.
    pub fn expired(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<MachineId> {
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        let mut expired: Vec<MachineId> = self
            .machines
            .values()
            .filter(|m| m.state != MachineState::Pending)
            .filter(|m| now - m.last_heartbeat_at > max_age)
            .map(|m| m.id)
            .collect();
        expired.sort();
        expired
    }

    /// All machines, oldest first.
    pub fn views(&self) -> Vec<MachineView> {
        let mut views: Vec<MachineView> = self.machines.values().map(Machine::view).collect();
        views.sort_by_key(|v| v.id);
        views
    }

    /// True when the pool holds exactly the `Partial` machines.
    pub fn pool_is_consistent(&self) -> bool {
        let partial: BTreeSet<MachineId> = self
            .machines
            .values()
            .filter(|m| m.state == MachineState::Partial)
            .map(|m| m.id)
            .collect();
        partial == self.available
    }

    fn sync_pool(&mut self, id: MachineId, state: MachineState) {
        if state == MachineState::Partial {
            self.available.insert(id);
        } else {
            self.available.remove(&id);
        }
    }
}

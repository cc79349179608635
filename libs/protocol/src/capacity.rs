//! Capacity and lifecycle enumerations.

use serde::{Deserialize, Serialize};

/// Capacity of a single machine as its process manager reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CapacityState {
    Empty,
    Partial,
    Full,
    /// Latched once the PM agreed to shut down; never derived from counts.
    ShuttingDown,
}

impl CapacityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityState::Empty => "empty",
            CapacityState::Partial => "partial",
            CapacityState::Full => "full",
            CapacityState::ShuttingDown => "shuttingDown",
        }
    }
}

impl std::fmt::Display for CapacityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fleet manager's view of a machine.
///
/// Superset of [`CapacityState`]: `Pending` and `RecentLaunchUnknown` only
/// exist on the FM side and can never arrive in a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MachineState {
    Empty,
    Partial,
    Full,
    /// Reserved by an in-flight allocation. Heartbeats do not touch it.
    Pending,
    /// Teardown in progress. Heartbeats do not touch it.
    ShuttingDown,
    /// Quarantined after an ambiguous allocation or shutdown exchange.
    RecentLaunchUnknown,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Empty => "empty",
            MachineState::Partial => "partial",
            MachineState::Full => "full",
            MachineState::Pending => "pending",
            MachineState::ShuttingDown => "shuttingDown",
            MachineState::RecentLaunchUnknown => "recentLaunchUnknown",
        }
    }

    /// Whether the fleet manager owns this state outright, so that a
    /// racing heartbeat must not overwrite it.
    pub fn is_locally_authoritative(&self) -> bool {
        matches!(self, MachineState::Pending | MachineState::ShuttingDown)
    }
}

impl From<CapacityState> for MachineState {
    fn from(state: CapacityState) -> Self {
        match state {
            CapacityState::Empty => MachineState::Empty,
            CapacityState::Partial => MachineState::Partial,
            CapacityState::Full => MachineState::Full,
            CapacityState::ShuttingDown => MachineState::ShuttingDown,
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one worker process on a PM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    /// Spawned, no heartbeat seen yet.
    Starting,
    Running,
}

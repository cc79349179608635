//! Bodies served by a process manager.

use fleet_id::ProcessId;
use serde::{Deserialize, Serialize};

use crate::{CapacityState, LifecycleState};

/// Request body for `POST /processes`, on both the PM and the FM.
///
/// `params` is opaque: it is handed to the worker untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessParams {
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Outcome tag of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartOutcome {
    #[serde(rename = "OK")]
    Ok,
    AlreadyFull,
    AlreadyShuttingDown,
}

impl StartOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartOutcome::Ok => "OK",
            StartOutcome::AlreadyFull => "AlreadyFull",
            StartOutcome::AlreadyShuttingDown => "AlreadyShuttingDown",
        }
    }
}

impl std::fmt::Display for StartOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response to `POST /processes` on a PM.
///
/// Rejections still carry the current capacity and a fresh sequence index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessResponse {
    pub msg: StartOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<ProcessId>,
    pub capacity_state: CapacityState,
    /// Absent only when talking to a misbehaving PM; treated as untrusted.
    #[serde(default)]
    pub sequence_index: Option<u64>,
}

/// Outcome tag of a shutdown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownOutcome {
    #[serde(rename = "OK")]
    Ok,
    NotEmpty,
}

/// Response to `POST /shutdown` on a PM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownResponse {
    pub msg: ShutdownOutcome,
    pub capacity_state: CapacityState,
}

impl ShutdownResponse {
    pub fn accepted(&self) -> bool {
        self.msg == ShutdownOutcome::Ok && self.capacity_state == CapacityState::ShuttingDown
    }
}

/// Read-only projection of a managed process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessView {
    pub id: ProcessId,
    pub params: serde_json::Value,
    pub lifecycle_state: LifecycleState,
    /// Seconds since the last heartbeat (or since spawn).
    pub heartbeat_age: i64,
}

/// Single JSON line a PM prints on stdout once it is listening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyLine {
    pub ready: bool,
    pub listen_addr: std::net::SocketAddr,
    pub machine_id: fleet_id::MachineId,
}

//! Bodies served by the fleet manager.

use chrono::{DateTime, Utc};
use fleet_id::{MachineId, ProcessId};
use serde::{Deserialize, Serialize};

use crate::{CapacityState, MachineState};

/// Body of `POST /vms/{id}/heartbeat`, sent by a PM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineHeartbeat {
    pub sequence_index: u64,
    pub capacity_state: CapacityState,
}

/// Response to `POST /processes` on the FM.
///
/// `msg` is `"OK"` on success and a human-readable reason otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateResponse {
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<ProcessId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<MachineId>,
}

impl AllocateResponse {
    pub const OK: &'static str = "OK";

    pub fn is_ok(&self) -> bool {
        self.msg == Self::OK
    }
}

/// Registry entry as listed by `GET /vms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineView {
    pub id: MachineId,
    pub endpoint: String,
    pub cloud_provider_handle: String,
    pub capacity_state: MachineState,
    pub last_sequence_index: u64,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_wire_shape() {
        let json = r#"{"sequenceIndex":12,"capacityState":"partial"}"#;
        let heartbeat: MachineHeartbeat = serde_json::from_str(json).unwrap();
        assert_eq!(heartbeat.sequence_index, 12);
        assert_eq!(heartbeat.capacity_state, CapacityState::Partial);
    }

    #[test]
    fn test_heartbeat_cannot_claim_pending() {
        let json = r#"{"sequenceIndex":1,"capacityState":"pending"}"#;
        assert!(serde_json::from_str::<MachineHeartbeat>(json).is_err());
    }

    #[test]
    fn test_allocate_error_has_only_msg() {
        let response = AllocateResponse {
            msg: "no capacity".to_string(),
            process_id: None,
            machine_id: None,
        };
        assert!(!response.is_ok());
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"msg":"no capacity"}"#
        );
    }
}

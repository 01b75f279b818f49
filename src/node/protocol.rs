//! Wire types shared between the hub control plane and the node API.
//! Both ends live in this crate, so the request the orchestrator sends is
//! the same struct the node deserializes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Hub -> node: start streaming one VM-level backup. One request carries
/// all N disks; the node takes a single snapshot covering them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBackupRequest {
    pub job_id: i64,
    pub vm_name: String,
    pub vmware_uuid: String,
    pub backup_type: String,
    /// Multi-target descriptor; authoritative for disk-to-export mapping
    pub nbd_targets: String,
    /// Prior CBT change id per disk_index, present for incrementals
    #[serde(default)]
    pub previous_change_ids: HashMap<i32, String>,
}

/// Node -> hub: final status for a job, posted to the completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionPayload {
    pub per_disk: Vec<PerDiskCompletion>,
    pub overall_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerDiskCompletion {
    pub disk_index: i32,
    pub change_id: String,
    pub bytes_transferred: i64,
}

/// Node -> hub: one VM in the vCenter inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryVm {
    pub name: String,
    pub vmware_uuid: String,
    pub power_state: Option<String>,
    pub disks: Vec<InventoryDisk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryDisk {
    pub disk_index: i32,
    pub vmware_disk_key: i32,
    pub unit_number: i32,
    pub capacity_bytes: i64,
    pub backing_file: Option<String>,
}

pub const OVERALL_STATUS_COMPLETED: &str = "completed";
pub const OVERALL_STATUS_FAILED: &str = "failed";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_request_round_trips_with_change_ids() {
        let mut previous_change_ids = HashMap::new();
        previous_change_ids.insert(0, "52 3e/1".to_string());
        previous_change_ids.insert(1, "52 3e/7".to_string());

        let request = NodeBackupRequest {
            job_id: 42,
            vm_name: "beta".to_string(),
            vmware_uuid: "4210f0a1".to_string(),
            backup_type: "incremental".to_string(),
            nbd_targets: "2000:nbd://127.0.0.1:10100/e0".to_string(),
            previous_change_ids,
        };

        let json = serde_json::to_string(&request).unwrap();
        let parsed: NodeBackupRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.previous_change_ids.get(&1).unwrap(), "52 3e/7");
    }

    #[test]
    fn change_ids_default_to_empty_for_full_backups() {
        let json = r#"{"job_id":1,"vm_name":"alpha","vmware_uuid":"u","backup_type":"full","nbd_targets":"2000:nbd://127.0.0.1:10100/e"}"#;
        let parsed: NodeBackupRequest = serde_json::from_str(json).unwrap();
        assert!(parsed.previous_change_ids.is_empty());
    }
}

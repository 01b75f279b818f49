use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A managed VM, mirrored from the node's vCenter inventory.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Vm {
    pub id: i64,
    pub name: String,
    pub vmware_uuid: String,
    pub power_state: Option<String>,
    pub synced_at: DateTime<Utc>,
}

/// A disk of a managed VM. `vmware_disk_key` is the hypervisor's per-VM
/// device key (typically 2000 + unit number); `disk_index` is our stable
/// 0-based ordering. The two must never be conflated on the wire.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct VmDisk {
    pub id: i64,
    pub vm_id: i64,
    pub disk_index: i32,
    pub vmware_disk_key: i32,
    pub unit_number: i32,
    pub capacity_bytes: i64,
    pub backing_file: Option<String>,
}

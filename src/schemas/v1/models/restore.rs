use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row per actively mounted disk of a completed backup. References the
/// per-disk record, never the VM-level job; cascade-removed with the disk.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct RestoreMount {
    pub id: i64,
    pub mount_uuid: String,
    pub backup_disk_id: i64,
    pub block_device: String,
    pub base_mount_path: String,
    /// JSON array of [`PartitionInfo`]
    pub partition_metadata: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// What mounted where for a single partition of a restore mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionInfo {
    /// 1-based, in discovery order; also the `partition-{n}` directory name
    pub index: u32,
    /// Kernel partition device, e.g. /dev/nbd3p1
    pub device: String,
    /// Absolute path the partition is mounted at, if it mounted
    pub mount_path: Option<String>,
    pub size_bytes: u64,
    pub filesystem: Option<String>,
    pub label: Option<String>,
}

impl RestoreMount {
    /// Decodes the stored partition metadata.
    pub fn partitions(&self) -> Vec<PartitionInfo> {
        serde_json::from_value(self.partition_metadata.clone()).unwrap_or_default()
    }
}

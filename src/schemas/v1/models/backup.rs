use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per (VM, repository). Created on the first backup attempt for
/// the pair and kept for the life of the repository; jobs hang off it.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupContext {
    pub id: i64,
    pub vm_name: String,
    pub vmware_uuid: String,
    pub repository_id: i64,
    pub created_at: DateTime<Utc>,
}

/// One row per user-initiated VM-level backup, full or incremental.
/// Status transitions once from `running` to `completed` or `failed` and is
/// immutable afterwards.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: i64,
    pub context_id: i64,
    pub backup_type: String, // enum: 'full', 'incremental'
    pub status: String,      // enum: 'running', 'completed', 'failed'
    pub policy_id: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One row per disk within a job. `disk_change_id` is the CBT identifier
/// reported by the node on completion and stays NULL until then.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupDisk {
    pub id: i64,
    pub job_id: i64,
    pub disk_index: i32,
    pub vmware_disk_key: i32,
    pub qcow2_path: String,
    pub size_bytes: i64,
    pub bytes_transferred: Option<i64>,
    pub disk_change_id: Option<String>,
    pub status: String, // enum: 'running', 'completed', 'failed'
}

pub const BACKUP_TYPE_FULL: &str = "full";
pub const BACKUP_TYPE_INCREMENTAL: &str = "incremental";

pub const JOB_STATUS_RUNNING: &str = "running";
pub const JOB_STATUS_COMPLETED: &str = "completed";
pub const JOB_STATUS_FAILED: &str = "failed";

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A local-filesystem QCOW2 repository. Backup files live under
/// `{root_path}/{vm}/disk-{index}/`.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub root_path: String,
    pub created_at: DateTime<Utc>,
}

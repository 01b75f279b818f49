use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedState {
    pub instance_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl SharedState {
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            started_at: Utc::now(),
        }
    }
}

//! General API models shared by the hub and node services outside the
//! versioned control-plane routes in /src/schemas/VERSION/api.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatusMessage {
    pub role: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: ServiceStatusMessage,
}

//! Core API endpoints for the CoreVault hub.
//!
//! These endpoints serve as the primary interface for load balancers and
//! monitoring systems to query the health of the appliance; everything
//! backup-related lives under the versioned routes in schemas/v1/api.

use crate::api_models::{ApiResponse, ServiceStatusMessage};
use crate::state::SharedState;
use rocket::get;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health check endpoint that provides basic service availability status.
///
/// # Returns
///
/// A JSON response with status "ok" and basic service information.
#[get("/health")]
pub async fn health_check(
    state: &rocket::State<Arc<RwLock<SharedState>>>,
) -> rocket::serde::json::Json<ApiResponse> {
    log::debug!("Health check endpoint called");
    let state = state.read().await;
    rocket::serde::json::Json(ApiResponse {
        status: "ok".to_string(),
        message: ServiceStatusMessage {
            role: "hub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: state.started_at,
        },
    })
}

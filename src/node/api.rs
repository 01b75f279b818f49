//! The node's local HTTP API, reached by the hub over the reverse
//! tunnel. Accepting a backup returns 202 immediately; the streaming
//! work runs in a spawned task and reports to the hub's completion
//! endpoint when it finishes.

use crate::config::NodeConfig;
use crate::node::backup::{self, JobRegistry};
use crate::node::protocol::{InventoryDisk, InventoryVm, NodeBackupRequest};
use crate::node::vsphere::VSphereClient;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{get, post, routes, State};
use std::sync::Arc;

#[get("/health")]
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "role": "node" }))
}

/// Accepts a VM backup for streaming. The descriptor in the request is
/// authoritative for disk-to-export mapping.
#[post("/backup/start", format = "json", data = "<request>")]
pub async fn start_backup(
    config: &State<Arc<NodeConfig>>,
    registry: &State<Arc<JobRegistry>>,
    request: Json<NodeBackupRequest>,
) -> Result<(Status, Json<Value>), Status> {
    let request = request.into_inner();

    if request.nbd_targets.trim().is_empty() {
        return Err(Status::BadRequest);
    }

    log::info!(
        "Accepted backup job {} for '{}' ({})",
        request.job_id,
        request.vm_name,
        request.backup_type
    );

    let job_id = request.job_id;
    let config = config.inner().clone();
    let registry = registry.inner().clone();
    tokio::spawn(async move {
        backup::run_backup(config, registry, request).await;
    });

    Ok((Status::Accepted, Json(json!({ "job_id": job_id, "accepted": true }))))
}

/// Best-effort abort of a streaming job.
#[post("/backup/<job_id>/cancel")]
pub async fn cancel_backup(
    registry: &State<Arc<JobRegistry>>,
    job_id: i64,
) -> Json<Value> {
    let known = registry.cancel(job_id).await;
    Json(json!({ "job_id": job_id, "cancelling": known }))
}

/// The vCenter inventory, shaped for the hub's managed-VM sync. Disk
/// index is assigned by ascending device key, which is the same stable
/// order the hub uses when it builds target descriptors.
#[get("/inventory")]
pub async fn inventory(config: &State<Arc<NodeConfig>>) -> Result<Json<Vec<InventoryVm>>, Status> {
    let vsphere = VSphereClient::new(config.inner().clone()).map_err(|e| {
        log::error!("Could not build vSphere client: {}", e);
        Status::InternalServerError
    })?;

    if let Err(e) = vsphere.login().await {
        log::error!("vSphere login failed: {}", e);
        return Err(Status::BadGateway);
    }

    let vms = vsphere.list_vms().await.map_err(|e| {
        log::error!("Inventory retrieval failed: {}", e);
        Status::BadGateway
    })?;

    let inventory = vms
        .into_iter()
        .map(|vm| InventoryVm {
            name: vm.name,
            vmware_uuid: vm.instance_uuid,
            power_state: vm.power_state,
            disks: vm
                .disks
                .iter()
                .enumerate()
                .map(|(index, disk)| InventoryDisk {
                    disk_index: index as i32,
                    vmware_disk_key: disk.key,
                    unit_number: disk.unit_number,
                    capacity_bytes: disk.capacity_bytes,
                    backing_file: if disk.backing_file.is_empty() {
                        None
                    } else {
                        Some(disk.backing_file.clone())
                    },
                })
                .collect(),
        })
        .collect();

    Ok(Json(inventory))
}

pub fn node_routes() -> Vec<rocket::Route> {
    routes![health, start_backup, cancel_backup, inventory]
}

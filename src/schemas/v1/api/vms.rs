use crate::orchestrator::BackupOrchestrator;
use crate::schemas::v1::db::queries as db;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{get, post, State};
use sqlx::MySql;
use std::sync::Arc;

#[get("/vms")]
pub async fn list_vms(
    pool: &State<sqlx::Pool<MySql>>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let vms = db::vm::list_vms(pool).await.map_err(|e| {
        (
            Status::InternalServerError,
            Json(json!({ "error": e.to_string() })),
        )
    })?;

    let mut annotated = Vec::with_capacity(vms.len());
    for vm in vms {
        let disks = db::vm::disks_for_vm(pool, vm.id).await.unwrap_or_default();
        annotated.push(json!({ "vm": vm, "disks": disks }));
    }

    Ok(Json(json!({ "vms": annotated })))
}

/// Pulls the current inventory from the node and refreshes the managed
/// VM table. The orchestrator resolves backup requests against this.
#[post("/vms/sync")]
pub async fn sync_vms(
    orchestrator: &State<Arc<BackupOrchestrator>>,
    pool: &State<sqlx::Pool<MySql>>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let inventory = orchestrator.node().fetch_inventory().await.map_err(|e| {
        (e.http_status(), Json(json!({ "error": e.to_string() })))
    })?;

    let mut synced = 0usize;
    for vm in &inventory {
        let disks: Vec<(i32, i32, i32, i64, Option<String>)> = vm
            .disks
            .iter()
            .map(|d| {
                (
                    d.disk_index,
                    d.vmware_disk_key,
                    d.unit_number,
                    d.capacity_bytes,
                    d.backing_file.clone(),
                )
            })
            .collect();

        db::vm::upsert_vm(
            pool,
            &vm.name,
            &vm.vmware_uuid,
            vm.power_state.as_deref(),
            &disks,
        )
        .await
        .map_err(|e| {
            (
                Status::InternalServerError,
                Json(json!({ "error": e.to_string() })),
            )
        })?;
        synced += 1;
    }

    log::info!("Inventory sync complete: {} VMs", synced);
    Ok(Json(json!({ "synced": synced })))
}

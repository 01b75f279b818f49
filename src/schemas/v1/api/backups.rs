use crate::config::ServerConfig;
use crate::node::protocol::CompletionPayload;
use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::{BackupOrchestrator, BackupRequest, CompletionOutcome};
use crate::restore::RestoreService;
use crate::schemas::v1::db::queries as db;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, State};
use sqlx::MySql;
use std::sync::Arc;

fn error_body(err: &OrchestratorError) -> (Status, Json<Value>) {
    (err.http_status(), Json(json!({ "error": err.to_string() })))
}

/// Request guard for the node's completion callback: the shared bearer
/// token from the hub configuration.
pub struct CallbackAuth;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CallbackAuth {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let config = request
            .guard::<&State<Arc<ServerConfig>>>()
            .await
            .expect("server config is always managed");

        let expected = format!("Bearer {}", config.callback_token);
        match request.headers().get_one("Authorization") {
            Some(header) if header == expected => Outcome::Success(CallbackAuth),
            _ => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}

/// Starts a VM-level backup. 202 means every block server is up and the
/// node has accepted the stream; data transfer continues asynchronously.
#[post("/backups", format = "json", data = "<request>")]
pub async fn start_backup(
    orchestrator: &State<Arc<BackupOrchestrator>>,
    request: Json<BackupRequest>,
) -> Result<(Status, Json<Value>), (Status, Json<Value>)> {
    match orchestrator.start_backup(request.into_inner()).await {
        Ok(started) => Ok((Status::Accepted, Json(json!(started)))),
        Err(e) => Err(error_body(&e)),
    }
}

/// Completion callback from the node client. Idempotent for a repeated
/// identical payload; 409 for anything else against a non-running job.
#[post("/backups/<backup_id>/complete", format = "json", data = "<payload>")]
pub async fn complete_backup(
    _auth: CallbackAuth,
    orchestrator: &State<Arc<BackupOrchestrator>>,
    backup_id: i64,
    payload: Json<CompletionPayload>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match orchestrator.handle_completion(backup_id, &payload).await {
        Ok(CompletionOutcome::Applied) => Ok(Json(json!({ "acknowledged": true }))),
        Ok(CompletionOutcome::AlreadyAcknowledged) => {
            Ok(Json(json!({ "acknowledged": true, "repeat": true })))
        }
        Err(e) => Err(error_body(&e)),
    }
}

#[get("/backups?<page>&<per_page>")]
pub async fn list_backups(
    pool: &State<sqlx::Pool<MySql>>,
    page: Option<i64>,
    per_page: Option<i64>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let page = page.unwrap_or(1);
    let per_page = per_page.unwrap_or(25);

    let jobs = db::job::list_jobs_paginated(pool, page, per_page)
        .await
        .map_err(|e| error_body(&e.into()))?;

    Ok(Json(json!({
        "backups": jobs,
        "pagination": { "page": page, "per_page": per_page }
    })))
}

#[get("/backups/<backup_id>")]
pub async fn get_backup(
    pool: &State<sqlx::Pool<MySql>>,
    backup_id: i64,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let job = db::job::get_job_by_id(pool, backup_id)
        .await
        .map_err(|e| error_body(&e.into()))?
        .ok_or((Status::NotFound, Json(json!({ "error": "no such backup" }))))?;

    let disks = db::disk::disks_for_job(pool, backup_id)
        .await
        .map_err(|e| error_body(&e.into()))?;

    Ok(Json(json!({ "backup": job, "disks": disks })))
}

#[get("/backups/<backup_id>/disks")]
pub async fn get_backup_disks(
    pool: &State<sqlx::Pool<MySql>>,
    backup_id: i64,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let disks = db::disk::disks_for_job(pool, backup_id)
        .await
        .map_err(|e| error_body(&e.into()))?;

    if disks.is_empty() {
        return Err((Status::NotFound, Json(json!({ "error": "no such backup" }))));
    }
    Ok(Json(json!({ "disks": disks })))
}

/// The full → incremental chain one disk of this backup belongs to,
/// oldest first.
#[get("/backups/<backup_id>/chain?<disk_index>")]
pub async fn get_backup_chain(
    pool: &State<sqlx::Pool<MySql>>,
    backup_id: i64,
    disk_index: Option<i32>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let job = db::job::get_job_by_id(pool, backup_id)
        .await
        .map_err(|e| error_body(&e.into()))?
        .ok_or((Status::NotFound, Json(json!({ "error": "no such backup" }))))?;

    let disk_index = disk_index.unwrap_or(0);
    let chain = db::disk::chain(pool, job.context_id, disk_index)
        .await
        .map_err(|e| error_body(&e.into()))?;

    Ok(Json(json!({ "disk_index": disk_index, "chain": chain })))
}

/// A running backup is cancelled; a terminal one is deleted, with chain
/// integrity enforced and any restore mounts of its disks torn down
/// first so no kernel state outlives the rows.
#[delete("/backups/<backup_id>")]
pub async fn delete_backup(
    orchestrator: &State<Arc<BackupOrchestrator>>,
    restore_service: &State<Arc<RestoreService>>,
    pool: &State<sqlx::Pool<MySql>>,
    backup_id: i64,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let job = db::job::get_job_by_id(pool, backup_id)
        .await
        .map_err(|e| error_body(&e.into()))?
        .ok_or((Status::NotFound, Json(json!({ "error": "no such backup" }))))?;

    if job.status == "running" {
        orchestrator
            .cancel_backup(backup_id)
            .await
            .map_err(|e| error_body(&e))?;
        return Ok(Json(json!({ "backup_id": backup_id, "cancelled": true })));
    }

    let disks = db::disk::disks_for_job(pool, backup_id)
        .await
        .map_err(|e| error_body(&e.into()))?;
    for disk in &disks {
        if let Ok(Some(mount)) = db::mount::active_mount_for_disk(pool, disk.id).await {
            restore_service.unmount(&mount.mount_uuid).await.map_err(|e| {
                (e.http_status(), Json(json!({ "error": e.to_string() })))
            })?;
        }
    }

    orchestrator
        .delete_backup(backup_id)
        .await
        .map_err(|e| error_body(&e))?;

    Ok(Json(json!({ "backup_id": backup_id, "deleted": true })))
}

use crate::restore::browse::{self, ResolvedPath};
use crate::restore::{RestoreError, RestoreService};
use crate::schemas::v1::db::queries as db;
use rocket::fs::NamedFile;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, State};
use serde::Deserialize;
use sqlx::MySql;
use std::sync::Arc;

fn error_body(err: &RestoreError) -> (Status, Json<Value>) {
    (err.http_status(), Json(json!({ "error": err.to_string() })))
}

#[derive(Debug, Deserialize)]
pub struct MountRequest {
    pub backup_id: i64,
    pub disk_index: i32,
}

/// Mounts one disk of a completed backup for file-level browsing.
#[post("/restore/mount", format = "json", data = "<request>")]
pub async fn mount_backup_disk(
    service: &State<Arc<RestoreService>>,
    pool: &State<sqlx::Pool<MySql>>,
    request: Json<MountRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let disk = db::disk::disk_for_job_index(pool, request.backup_id, request.disk_index)
        .await
        .map_err(|e| error_body(&e.into()))?
        .ok_or((
            Status::NotFound,
            Json(json!({ "error": "no such backup disk" })),
        ))?;

    let mount = service.mount_disk(disk.id).await.map_err(|e| error_body(&e))?;

    Ok(Json(json!({
        "mount_id": mount.mount_uuid,
        "partition_metadata": mount.partitions(),
        "expires_at": mount.expires_at,
    })))
}

/// Lists a directory. `/` is the synthetic partition listing; anything
/// under `/partition-N/` is a real directory of that partition.
#[get("/restore/<mount_id>/files?<path>")]
pub async fn list_files(
    service: &State<Arc<RestoreService>>,
    mount_id: &str,
    path: Option<&str>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let mount = service.get_mount(mount_id).await.map_err(|e| error_body(&e))?;
    let path = path.unwrap_or("/");

    let entries = match browse::resolve_browse_path(path).map_err(|e| error_body(&e))? {
        ResolvedPath::Root => browse::list_root(&mount.partitions()),
        ResolvedPath::Partition { index, subpath } => {
            let partition =
                RestoreService::partition_by_index(&mount, index).map_err(|e| error_body(&e))?;
            browse::list_directory(&partition, &subpath)
                .await
                .map_err(|e| error_body(&e))?
        }
    };

    Ok(Json(json!({ "path": path, "entries": entries })))
}

/// Streams one file out of a mounted partition. Traversal and symlink
/// escapes are rejected during resolution.
#[get("/restore/<mount_id>/download?<path>")]
pub async fn download_file(
    service: &State<Arc<RestoreService>>,
    mount_id: &str,
    path: &str,
) -> Result<NamedFile, (Status, Json<Value>)> {
    let mount = service.get_mount(mount_id).await.map_err(|e| error_body(&e))?;

    let (index, subpath) = match browse::resolve_browse_path(path).map_err(|e| error_body(&e))? {
        ResolvedPath::Partition { index, subpath } => (index, subpath),
        ResolvedPath::Root => {
            return Err((
                Status::BadRequest,
                Json(json!({ "error": "cannot download the mount root" })),
            ))
        }
    };

    let partition =
        RestoreService::partition_by_index(&mount, index).map_err(|e| error_body(&e))?;
    let resolved = browse::resolve_on_disk(&partition, &subpath)
        .await
        .map_err(|e| error_body(&e))?;

    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|e| error_body(&e.into()))?;
    if !metadata.is_file() {
        return Err((
            Status::BadRequest,
            Json(json!({ "error": "path is not a regular file" })),
        ));
    }

    NamedFile::open(&resolved).await.map_err(|e| error_body(&e.into()))
}

/// Unmounts and forgets a restore mount. Deleting twice is fine.
#[delete("/restore/<mount_id>")]
pub async fn unmount(
    service: &State<Arc<RestoreService>>,
    mount_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    service.unmount(mount_id).await.map_err(|e| error_body(&e))?;
    Ok(Json(json!({ "mount_id": mount_id, "unmounted": true })))
}

#[get("/restore/mounts")]
pub async fn list_mounts(
    pool: &State<sqlx::Pool<MySql>>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let mounts = db::mount::list_mounts(pool)
        .await
        .map_err(|e| error_body(&e.into()))?;
    Ok(Json(json!({ "mounts": mounts })))
}

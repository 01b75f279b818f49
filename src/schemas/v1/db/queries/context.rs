use crate::schemas::v1::models::backup::BackupContext;
use sqlx::{MySql, Pool};

/// Upserts the (VM, repository) backup context and returns its id.
///
/// At most one context exists per pair; the unique key on
/// (vmware_uuid, repository_id) enforces it, so a concurrent first backup
/// of the same VM resolves to the same row.
pub async fn ensure_context(
    pool: &Pool<MySql>,
    vm_name: &str,
    vmware_uuid: &str,
    repository_id: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query(
        "INSERT INTO backup_contexts (vm_name, vmware_uuid, repository_id) VALUES (?, ?, ?)
         ON DUPLICATE KEY UPDATE vm_name = VALUES(vm_name)",
    )
    .bind(vm_name)
    .bind(vmware_uuid)
    .bind(repository_id)
    .execute(pool)
    .await?;

    let context_id: i64 = sqlx::query_scalar(
        "SELECT id FROM backup_contexts WHERE vmware_uuid = ? AND repository_id = ?",
    )
    .bind(vmware_uuid)
    .bind(repository_id)
    .fetch_one(pool)
    .await?;

    Ok(context_id)
}

pub async fn get_context_by_id(
    pool: &Pool<MySql>,
    context_id: i64,
) -> Result<Option<BackupContext>, sqlx::Error> {
    sqlx::query_as::<_, BackupContext>("SELECT * FROM backup_contexts WHERE id = ?")
        .bind(context_id)
        .fetch_optional(pool)
        .await
}

use crate::schemas::v1::models::restore::RestoreMount;
use sqlx::{MySql, Pool};

/// Persists a restore mount record. The unique key on backup_disk_id
/// enforces at most one active mount per disk at the schema level too.
pub async fn create_mount(
    pool: &Pool<MySql>,
    mount_uuid: &str,
    backup_disk_id: i64,
    block_device: &str,
    base_mount_path: &str,
    partition_metadata: &serde_json::Value,
    expires_at: chrono::DateTime<chrono::Utc>,
) -> Result<RestoreMount, sqlx::Error> {
    sqlx::query(
        "INSERT INTO restore_mounts
         (mount_uuid, backup_disk_id, block_device, base_mount_path, partition_metadata, expires_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(mount_uuid)
    .bind(backup_disk_id)
    .bind(block_device)
    .bind(base_mount_path)
    .bind(partition_metadata)
    .bind(expires_at)
    .execute(pool)
    .await?;

    sqlx::query_as::<_, RestoreMount>("SELECT * FROM restore_mounts WHERE mount_uuid = ?")
        .bind(mount_uuid)
        .fetch_one(pool)
        .await
}

pub async fn get_mount_by_uuid(
    pool: &Pool<MySql>,
    mount_uuid: &str,
) -> Result<Option<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>("SELECT * FROM restore_mounts WHERE mount_uuid = ?")
        .bind(mount_uuid)
        .fetch_optional(pool)
        .await
}

pub async fn list_mounts(pool: &Pool<MySql>) -> Result<Vec<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>("SELECT * FROM restore_mounts ORDER BY id")
        .fetch_all(pool)
        .await
}

pub async fn active_mount_for_disk(
    pool: &Pool<MySql>,
    backup_disk_id: i64,
) -> Result<Option<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>("SELECT * FROM restore_mounts WHERE backup_disk_id = ?")
        .bind(backup_disk_id)
        .fetch_optional(pool)
        .await
}

/// Mounts whose idle TTL has elapsed; the eviction task tears these down.
pub async fn expired_mounts(pool: &Pool<MySql>) -> Result<Vec<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>("SELECT * FROM restore_mounts WHERE expires_at < NOW()")
        .fetch_all(pool)
        .await
}

pub async fn delete_mount(pool: &Pool<MySql>, mount_uuid: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM restore_mounts WHERE mount_uuid = ?")
        .bind(mount_uuid)
        .execute(pool)
        .await?;
    Ok(())
}

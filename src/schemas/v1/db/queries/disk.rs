use crate::schemas::v1::models::backup::BackupDisk;
use sqlx::{MySql, Pool};

/// Creates a per-disk record under a job.
pub async fn create_disk(
    pool: &Pool<MySql>,
    job_id: i64,
    disk_index: i32,
    vmware_disk_key: i32,
    qcow2_path: &str,
    size_bytes: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query(
        "INSERT INTO backup_disks (job_id, disk_index, vmware_disk_key, qcow2_path, size_bytes, status)
         VALUES (?, ?, ?, ?, ?, 'running')",
    )
    .bind(job_id)
    .bind(disk_index)
    .bind(vmware_disk_key)
    .bind(qcow2_path)
    .bind(size_bytes)
    .execute(pool)
    .await?;

    let disk_id: i64 = sqlx::query_scalar("SELECT LAST_INSERT_ID()")
        .fetch_one(pool)
        .await?;

    Ok(disk_id)
}

pub async fn disk_by_id(
    pool: &Pool<MySql>,
    disk_id: i64,
) -> Result<Option<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>("SELECT * FROM backup_disks WHERE id = ?")
        .bind(disk_id)
        .fetch_optional(pool)
        .await
}

/// Disks of a job in index order.
pub async fn disks_for_job(pool: &Pool<MySql>, job_id: i64) -> Result<Vec<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT * FROM backup_disks WHERE job_id = ? ORDER BY disk_index",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}

pub async fn disk_for_job_index(
    pool: &Pool<MySql>,
    job_id: i64,
    disk_index: i32,
) -> Result<Option<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT * FROM backup_disks WHERE job_id = ? AND disk_index = ?",
    )
    .bind(job_id)
    .bind(disk_index)
    .fetch_optional(pool)
    .await
}

/// Marks a disk completed and records its CBT change id. The change id is
/// what future incrementals chain against, so it is only ever written here.
pub async fn complete_disk(
    pool: &Pool<MySql>,
    disk_id: i64,
    change_id: &str,
    bytes_transferred: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_disks SET status = 'completed', disk_change_id = ?, bytes_transferred = ?
         WHERE id = ? AND status = 'running'",
    )
    .bind(change_id)
    .bind(bytes_transferred)
    .bind(disk_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fail_disk(pool: &Pool<MySql>, disk_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE backup_disks SET status = 'failed' WHERE id = ? AND status = 'running'")
        .bind(disk_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// The most recent completed disk for (context, disk_index); the parent an
/// incremental chains against.
pub async fn latest_completed_disk(
    pool: &Pool<MySql>,
    context_id: i64,
    disk_index: i32,
) -> Result<Option<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT d.* FROM backup_disks d
         JOIN backup_jobs j ON j.id = d.job_id
         WHERE j.context_id = ? AND d.disk_index = ? AND d.status = 'completed'
         ORDER BY d.id DESC LIMIT 1",
    )
    .bind(context_id)
    .bind(disk_index)
    .fetch_optional(pool)
    .await
}

/// Full chain for (context, disk_index), oldest first. Links are implied by
/// creation order; the QCOW2 backing-file pointers follow the same order.
pub async fn chain(
    pool: &Pool<MySql>,
    context_id: i64,
    disk_index: i32,
) -> Result<Vec<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT d.* FROM backup_disks d
         JOIN backup_jobs j ON j.id = d.job_id
         WHERE j.context_id = ? AND d.disk_index = ? AND d.status = 'completed'
         ORDER BY d.id ASC",
    )
    .bind(context_id)
    .bind(disk_index)
    .fetch_all(pool)
    .await
}

/// True when a completed disk newer than `disk_id` exists in the same
/// (context, disk_index) chain, i.e. deleting `disk_id` would orphan a
/// child whose QCOW2 backing file points at it.
pub async fn has_chain_descendant(
    pool: &Pool<MySql>,
    context_id: i64,
    disk_index: i32,
    disk_id: i64,
) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM backup_disks d
         JOIN backup_jobs j ON j.id = d.job_id
         WHERE j.context_id = ? AND d.disk_index = ? AND d.status = 'completed' AND d.id > ?",
    )
    .bind(context_id)
    .bind(disk_index)
    .bind(disk_id)
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}

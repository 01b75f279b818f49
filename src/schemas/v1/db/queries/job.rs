use crate::schemas::v1::models::backup::BackupJob;
use sqlx::{MySql, Pool};

/// Creates a VM-level job in `running` state and returns its id.
pub async fn create_job(
    pool: &Pool<MySql>,
    context_id: i64,
    backup_type: &str,
    policy_id: Option<i64>,
) -> Result<i64, sqlx::Error> {
    tracing::info!(
        context_id = context_id,
        backup_type = backup_type,
        "Creating backup job"
    );

    // policy_id must land as true NULL when absent; binding the Option
    // directly does that.
    sqlx::query(
        "INSERT INTO backup_jobs (context_id, backup_type, status, policy_id)
         VALUES (?, ?, 'running', ?)",
    )
    .bind(context_id)
    .bind(backup_type)
    .bind(policy_id)
    .execute(pool)
    .await?;

    let job_id: i64 = sqlx::query_scalar("SELECT LAST_INSERT_ID()")
        .fetch_one(pool)
        .await?;

    Ok(job_id)
}

pub async fn get_job_by_id(
    pool: &Pool<MySql>,
    job_id: i64,
) -> Result<Option<BackupJob>, sqlx::Error> {
    sqlx::query_as::<_, BackupJob>("SELECT * FROM backup_jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Paginated job list, newest first.
pub async fn list_jobs_paginated(
    pool: &Pool<MySql>,
    page: i64,
    page_size: i64,
) -> Result<Vec<BackupJob>, sqlx::Error> {
    sqlx::query_as::<_, BackupJob>(
        "SELECT * FROM backup_jobs ORDER BY id DESC LIMIT ? OFFSET ?",
    )
    .bind(page_size)
    .bind((page - 1).max(0) * page_size)
    .fetch_all(pool)
    .await
}

/// Jobs still marked `running` that started before the given cutoff.
/// The orchestrator's watchdog fails these.
pub async fn stale_running_jobs(
    pool: &Pool<MySql>,
    cutoff: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<BackupJob>, sqlx::Error> {
    sqlx::query_as::<_, BackupJob>(
        "SELECT * FROM backup_jobs WHERE status = 'running' AND started_at < ?",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

/// Transitions a running job to `completed`. Terminal states are
/// immutable, so the status guard is part of the statement.
pub async fn complete_job(pool: &Pool<MySql>, job_id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE backup_jobs SET status = 'completed', finished_at = NOW()
         WHERE id = ? AND status = 'running'",
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Transitions a running job to `failed` with an error message.
pub async fn fail_job(pool: &Pool<MySql>, job_id: i64, error: &str) -> Result<bool, sqlx::Error> {
    tracing::warn!(job_id = job_id, error = error, "Failing backup job");

    let result = sqlx::query(
        "UPDATE backup_jobs SET status = 'failed', error_message = ?, finished_at = NOW()
         WHERE id = ? AND status = 'running'",
    )
    .bind(error)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Deletes a terminal job row; disks and mounts follow by cascade.
pub async fn delete_job(pool: &Pool<MySql>, job_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM backup_jobs WHERE id = ?")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

use anyhow::{Context, Result};
use sqlx::{MySql, Pool, Row};

/// Retrieves a metadata value by its key.
pub async fn get_meta_value(pool: &Pool<MySql>, key: &str) -> Result<String> {
    let row = sqlx::query("SELECT value FROM metadata WHERE `key` = ?")
        .bind(key)
        .fetch_one(pool)
        .await
        .context(format!("Failed to fetch metadata key {}", key))?;

    Ok(row.get::<String, _>("value"))
}

/// Sets a metadata value, inserting or updating as needed.
pub async fn set_meta_value(pool: &Pool<MySql>, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO metadata (`key`, value) VALUES (?, ?)
         ON DUPLICATE KEY UPDATE value = VALUES(value)",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context(format!("Failed to set metadata key {}", key))?;

    Ok(())
}

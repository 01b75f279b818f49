pub mod queries;
pub mod utils;

use sqlx::MySql;
use utils::split_sql_statements;

/// Initializes the hub schema from sql/db_init.sql. Every statement in the
/// file is idempotent, so re-running on an existing database is safe.
pub async fn init_schema(version: i64, pool: &sqlx::Pool<MySql>) -> Result<(), sqlx::Error> {
    log::info!("Initializing schema version {}", version);

    let statements = split_sql_statements(include_str!("../../../../sql/db_init.sql"));

    for statement in statements {
        if !statement.trim().is_empty() {
            log::debug!("Executing statement: {}", statement);
            sqlx::query(&statement).execute(pool).await?;
        }
    }

    Ok(())
}

use crate::db_manager;
use crate::db_manager::error::DatabaseError;
use log::{info, warn};
use sqlx::{MySql, Pool};
use std::env;

/// Manages database schema migrations for the hub.
pub struct MigrationManager;

impl MigrationManager {
    /// Initializes and migrates the hub database schema.
    pub async fn initialize_schema(
        db_manager: &db_manager::DatabaseManager,
    ) -> Result<(), DatabaseError> {
        info!("Initializing hub database schema...");

        let pool = db_manager.get_main_pool();

        let target_version = Self::get_target_schema_version()?;
        let current_version = Self::get_current_schema_version(pool).await?;

        if current_version == target_version {
            info!("Schema version check: OK (version {})", current_version);
            return Ok(());
        }

        warn!(
            "Schema version mismatch! Current: {}, Target: {}",
            current_version, target_version
        );

        crate::schemas::v1::db::init_schema(target_version, pool)
            .await
            .map_err(|e| {
                DatabaseError::MigrationError(format!("Failed to migrate hub schema: {}", e))
            })?;

        crate::schemas::v1::db::queries::metadata::set_meta_value(
            pool,
            "corevault_schema_version",
            &target_version.to_string(),
        )
        .await
        .map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to update schema version: {}", e))
        })?;

        info!(
            "Schema migrated from version {} to {}",
            current_version, target_version
        );

        Ok(())
    }

    /// Gets the target schema version from environment or defaults to 1.
    fn get_target_schema_version() -> Result<i64, DatabaseError> {
        let version = env::var("COREVAULT_SCHEMA_VERSION")
            .unwrap_or_else(|_| "1".to_string())
            .parse::<i64>()
            .map_err(|_| DatabaseError::Other("Invalid schema version".into()))?;

        Ok(version)
    }

    /// Gets the current schema version from the database.
    async fn get_current_schema_version(pool: &Pool<MySql>) -> Result<i64, DatabaseError> {
        // Check if metadata table exists
        let metadata_exists = sqlx::query("SHOW TABLES LIKE 'metadata'")
            .fetch_optional(pool)
            .await
            .map_err(DatabaseError::SqlxError)?
            .is_some();

        if !metadata_exists {
            return Ok(0); // No schema version yet
        }

        let version =
            crate::schemas::v1::db::queries::metadata::get_meta_value(pool, "corevault_schema_version")
                .await
                .unwrap_or_else(|_| "0".to_string())
                .parse::<i64>()
                .unwrap_or(0);

        Ok(version)
    }
}

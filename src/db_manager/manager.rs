use crate::db_manager::connection::ConnectionManager;
use crate::db_manager::error::DatabaseError;
use crate::db_manager::migration::MigrationManager;
use sqlx::{MySql, Pool};

/// Central manager for all database operations on the hub.
pub struct DatabaseManager {
    /// Connection manager for database pools
    connection_manager: ConnectionManager,
}

impl DatabaseManager {
    /// Creates a new database manager and brings the schema up to date.
    pub async fn new(connection_url: &str) -> Result<Self, DatabaseError> {
        let connection_manager = ConnectionManager::new(connection_url).await?;

        let manager = Self { connection_manager };

        manager.initialize_schema().await?;

        Ok(manager)
    }

    /// Initializes the hub database schema.
    pub async fn initialize_schema(&self) -> Result<(), DatabaseError> {
        MigrationManager::initialize_schema(self).await
    }

    /// Gets the main database pool.
    pub fn get_main_pool(&self) -> &Pool<MySql> {
        self.connection_manager.main_pool()
    }
}

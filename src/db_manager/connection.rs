use crate::db_manager::error::DatabaseError;
use log::info;
use sqlx::{MySql, MySqlPool, Pool};

const MAIN_DATABASE: &str = "corevault";

/// Manages database connections for the hub.
pub struct ConnectionManager {
    /// Main application database pool
    main_pool: Pool<MySql>,
}

impl ConnectionManager {
    /// Creates a new connection manager.
    ///
    /// Connects to the MySQL server first without naming a database so the
    /// main database can be created on a fresh appliance, then opens the
    /// pool the rest of the hub uses.
    pub async fn new(base_url: &str) -> Result<Self, DatabaseError> {
        info!("Connecting to MySQL server at {}", base_url);
        let server_pool = MySqlPool::connect(base_url)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        Self::ensure_database_exists(&server_pool, MAIN_DATABASE).await?;

        let main_db_url = format!("{}/{}", base_url, MAIN_DATABASE);
        info!("Connecting to main database at {}", main_db_url);
        let main_pool = MySqlPool::connect(&main_db_url).await.map_err(|e| {
            DatabaseError::ConnectionError(format!("Failed to connect to main database: {}", e))
        })?;

        info!("✓ Database connection established");

        Ok(Self { main_pool })
    }

    /// Ensures a database exists, creating it if necessary.
    pub async fn ensure_database_exists(
        pool: &Pool<MySql>,
        db_name: &str,
    ) -> Result<(), DatabaseError> {
        info!("Ensuring database exists: {}", db_name);
        let query = format!("CREATE DATABASE IF NOT EXISTS `{}`", db_name);
        sqlx::query(&query)
            .execute(pool)
            .await
            .map_err(DatabaseError::SqlxError)?;

        info!("✓ Database {} exists or was created", db_name);
        Ok(())
    }

    /// Gets the main database pool.
    pub fn main_pool(&self) -> &Pool<MySql> {
        &self.main_pool
    }
}

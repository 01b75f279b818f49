use colored::Colorize;
use std::env;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use corevault::config::SERVER_CONFIG;
use corevault::db_manager::DatabaseManager;
use corevault::logging;
use corevault::orchestrator::{watchdog, BackupOrchestrator};
use corevault::restore::{eviction, RestoreService};
use corevault::server::build_rocket;
use corevault::state::SharedState;
use corevault::transport::{BlockServerSupervisor, PortAllocator};

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    logging::setup_logging();

    let config = SERVER_CONFIG.clone();

    let database_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| "mysql://root@localhost:3306".to_string());

    log::info!("{}", "Connecting to the metadata store".cyan());
    let db_manager = Arc::new(DatabaseManager::new(&database_url).await?);
    let pool = db_manager.get_main_pool().clone();

    // Transport: the pool starts fully free on every boot, because no
    // backup survives a hub restart.
    let allocator = Arc::new(PortAllocator::new(config.nbd_port_min, config.nbd_port_max));
    let supervisor = Arc::new(BlockServerSupervisor::new(&config.qemu_nbd_path));
    log::info!(
        "NBD port pool [{}, {}] ready ({} ports)",
        config.nbd_port_min,
        config.nbd_port_max,
        config.nbd_pool_size()
    );

    let orchestrator = Arc::new(BackupOrchestrator::new(
        pool.clone(),
        allocator.clone(),
        supervisor.clone(),
        config.clone(),
    ));

    let restore_service = Arc::new(RestoreService::new(pool.clone(), config.clone()));

    // Background maintenance: stale-job watchdog and restore eviction.
    tokio::spawn(watchdog::run_watchdog(
        orchestrator.clone(),
        config.job_max_duration_secs,
    ));
    tokio::spawn(eviction::run_eviction(restore_service.clone()));

    let shared_state = Arc::new(RwLock::new(SharedState::new(Uuid::new_v4())));

    let rocket = build_rocket(
        config,
        db_manager,
        pool,
        allocator,
        supervisor,
        orchestrator,
        restore_service,
        shared_state,
    );

    log::info!("{}", "🚀 LAUNCHING HUB...".bright_cyan().bold());
    rocket.launch().await?;

    Ok(())
}

use colored::Colorize;
use rocket::{routes, Build, Rocket};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::ServerConfig;
use crate::cors::{cors_preflight, CORS};
use crate::db_manager::DatabaseManager;
use crate::endpoints::health_check;
use crate::orchestrator::BackupOrchestrator;
use crate::restore::RestoreService;
use crate::schemas::v1::api;
use crate::state::SharedState;
use crate::transport::{BlockServerSupervisor, PortAllocator};

pub trait RocketExt {
    fn mount_routes(self, routes: Vec<(&'static str, Vec<rocket::Route>)>) -> Self;
}

impl RocketExt for Rocket<Build> {
    fn mount_routes(self, routes: Vec<(&'static str, Vec<rocket::Route>)>) -> Self {
        let mut rocket = self;
        for (path, routes) in routes {
            log::info!("{}", format!("Mounting routes at {}", path).green());
            rocket = rocket.mount(path, routes);
        }
        rocket
    }
}

#[allow(clippy::too_many_arguments)]
pub fn build_rocket(
    config: Arc<ServerConfig>,
    db_manager: Arc<DatabaseManager>,
    pool: sqlx::Pool<sqlx::MySql>,
    allocator: Arc<PortAllocator>,
    supervisor: Arc<BlockServerSupervisor>,
    orchestrator: Arc<BackupOrchestrator>,
    restore_service: Arc<RestoreService>,
    shared_state: Arc<RwLock<SharedState>>,
) -> Rocket<Build> {
    crate::logging::print_banner("COREVAULT HUB", |s| s.bright_cyan());

    log::info!("{}", "Defining control-plane routes".cyan());
    let routes = vec![
        ("/", routes![health_check, cors_preflight]),
        ("/api/v1", api::routes()),
    ];

    log::info!("{}", "Building Rocket instance".cyan());
    let address: std::net::IpAddr = config
        .address
        .parse()
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)));

    let rocket_instance = rocket::build()
        .configure(rocket::Config {
            port: config.port,
            address,
            ..Default::default()
        })
        .manage(config)
        .manage(db_manager)
        .manage(pool)
        .manage(allocator)
        .manage(supervisor)
        .manage(orchestrator)
        .manage(restore_service)
        .manage(shared_state)
        .attach(CORS);

    log::info!("{}", "Mounting control-plane routes".cyan());
    rocket_instance.mount_routes(routes)
}

use colored::Colorize;
use std::sync::Arc;

use corevault::config::NODE_CONFIG;
use corevault::logging;
use corevault::node::api::node_routes;
use corevault::node::backup::JobRegistry;
use corevault::tunnel;

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    logging::setup_logging();

    let config = NODE_CONFIG.clone();
    logging::print_banner("COREVAULT NODE", |s| s.bright_green());

    // The tunnel lives on its own thread: ssh2 is blocking and the event
    // loop never yields. Systemd restarts the whole process if this
    // thread panics its way out.
    if config.tunnel.enabled {
        let tunnel_config = config.tunnel.clone();
        let api_port = config.port;
        std::thread::spawn(move || {
            tunnel::run_forever(tunnel_config, api_port);
        });
    } else {
        log::warn!("Tunnel disabled by configuration; assuming local hub");
    }

    let registry = Arc::new(JobRegistry::new());

    let address: std::net::IpAddr = config
        .address
        .parse()
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)));

    log::info!("{}", "🚀 LAUNCHING NODE API...".bright_green().bold());
    let _rocket = rocket::build()
        .configure(rocket::Config {
            port: config.port,
            address,
            ..Default::default()
        })
        .manage(config)
        .manage(registry)
        .mount("/", node_routes())
        .launch()
        .await?;

    Ok(())
}

use clap::{Arg, Command};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use minidfs::config::load_config;
use minidfs::logging;
use minidfs::master_service::MasterService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("master")
        .version("1.0")
        .about("Starts the minidfs metadata master")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .default_value("config.toml")
                .help("Path to the TOML configuration file"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").expect("has default");
    let config = load_config(config_path)?;
    let _guard = logging::init(&config.common, &config.master.log_path);

    let addr = config.master_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("master listening on {addr}");

    let service = Arc::new(MasterService::new(config.master, config.common));
    service.start_monitor();
    service.start_healer();

    let server = tokio::spawn(Arc::clone(&service).serve(listener));
    tokio::select! {
        _ = server => {}
        _ = tokio::signal::ctrl_c() => info!("master shutting down"),
    }
    Ok(())
}

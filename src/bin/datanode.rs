use clap::{Arg, Command};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use minidfs::config::load_config;
use minidfs::datanode_service::DataNodeService;
use minidfs::logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("datanode")
        .version("1.0")
        .about("Starts a minidfs data node")
        .arg(
            Arg::new("node_id")
                .value_name("NODE_ID")
                .required(true)
                .help("Integer id of this data node; it listens on base_port + id"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .default_value("config.toml")
                .help("Path to the TOML configuration file"),
        )
        .get_matches();

    let node_id: u32 = matches
        .get_one::<String>("node_id")
        .expect("node id is required")
        .parse()?;

    let config_path = matches.get_one::<String>("config").expect("has default");
    let config = load_config(config_path)?;
    let _guard = logging::init(&config.common, &config.datanode.log_path);

    let addr = format!("{}:{}", config.common.node_host, config.common.node_port(node_id));
    let listener = TcpListener::bind(&addr).await?;
    info!("data node {node_id} listening on {addr}");

    let service = Arc::new(DataNodeService::new(node_id, &config.datanode, config.common.clone())?);
    service.start_heartbeat(config.master_addr());

    let server = tokio::spawn(Arc::clone(&service).serve(listener));
    tokio::select! {
        _ = server => {}
        _ = tokio::signal::ctrl_c() => info!("data node {node_id} shutting down"),
    }
    Ok(())
}

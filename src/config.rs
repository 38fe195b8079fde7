use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    pub metadata_path: String,     // namespace snapshot, JSON
    pub monitor_interval: u64,     // heartbeat-timeout sweep, seconds
    pub healer_interval: u64,      // unconditional healing pass, seconds
    pub log_path: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            metadata_path: "metadata.json".to_string(),
            monitor_interval: 5,
            healer_interval: 10,
            log_path: "logs/master.log".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DataNodeConfig {
    pub data_root: String,         // chunks live at <data_root>/data_node_<id>/
    pub log_path: String,
}

impl Default for DataNodeConfig {
    fn default() -> Self {
        Self {
            data_root: ".".to_string(),
            log_path: "logs/datanode.log".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub log_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { log_path: "logs/client.log".to_string() }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub node_host: String,         // host the data nodes listen on
    pub node_base_port: u16,       // node i listens on node_base_port + i
    pub heartbeat_interval: u64,   // node -> master heartbeat, seconds
    pub heartbeat_timeout: u64,    // silence before a node is marked dead
    pub chunk_size: usize,         // max chunk body length in bytes
    pub replication_factor: usize, // desired replicas per chunk
    pub request_timeout: u64,      // master -> node socket timeout, seconds
    pub log_level: String,         // "debug", "info", ...
    pub log_output: String,        // "stdout" or "file"
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            node_host: "127.0.0.1".to_string(),
            node_base_port: 5000,
            heartbeat_interval: 5,
            heartbeat_timeout: 15,
            chunk_size: 1024,
            replication_factor: 2,
            request_timeout: 3,
            log_level: "info".to_string(),
            log_output: "stdout".to_string(),
        }
    }
}

impl CommonConfig {
    pub fn node_port(&self, node_id: u32) -> u16 {
        self.node_base_port + node_id as u16
    }

    pub fn node_addr(&self, node_id: u32) -> String {
        format!("{}:{}", self.node_host, self.node_port(node_id))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub master: MasterConfig,
    pub datanode: DataNodeConfig,
    pub client: ClientConfig,
    pub common: CommonConfig,
}

impl Config {
    pub fn master_addr(&self) -> String {
        format!("{}:{}", self.master.host, self.master.port)
    }
}

/// Load the TOML configuration. A missing file yields the built-in
/// defaults so every binary can launch with no setup.
pub fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.master.port, 5000);
        assert_eq!(config.common.chunk_size, 1024);
        assert_eq!(config.common.replication_factor, 2);
        assert_eq!(config.common.heartbeat_timeout, 15);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str("[common]\nchunk_size = 64\n").unwrap();
        assert_eq!(config.common.chunk_size, 64);
        assert_eq!(config.common.replication_factor, 2);
        assert_eq!(config.master.metadata_path, "metadata.json");
    }

    #[test]
    fn node_addresses_derive_from_base_port() {
        let common = CommonConfig::default();
        assert_eq!(common.node_port(3), 5003);
        assert_eq!(common.node_addr(1), "127.0.0.1:5001");
    }

    #[test]
    fn missing_file_loads_defaults() {
        let config = load_config("definitely-not-a-config.toml").unwrap();
        assert_eq!(config.master_addr(), "127.0.0.1:5000");
    }
}

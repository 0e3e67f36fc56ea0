use log::LevelFilter;
use serde::Deserialize;
use std::{
    env,
    fs::read_to_string,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::Path,
};

/// The client version extracted from the Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable key to load the config from
const CONFIG_ENV_KEY: &str = "TRUNKLINE_CONFIG_JSON";

pub fn load_config() -> Option<Config> {
    // Attempt to load the config from the env
    if let Ok(env) = env::var(CONFIG_ENV_KEY) {
        let config: Config = match serde_json::from_str(&env) {
            Ok(value) => value,
            Err(err) => {
                eprintln!("Failed to load env config (Using default): {:?}", err);
                return None;
            }
        };
        return Some(config);
    }

    // Attempt to load the config from disk
    let file = Path::new("config.json");
    if !file.exists() {
        return None;
    }

    let data = match read_to_string(file) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Failed to load config file (Using defaults): {:?}", err);
            return None;
        }
    };

    let config: Config = match serde_json::from_str(&data) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Failed to load config file (Using default): {:?}", err);
            return None;
        }
    };

    Some(config)
}

#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Local address the acceptor listens on
    pub listen: SocketAddr,
    /// Remote peer the hubs are dialed to
    pub remote: SocketAddr,
    /// Shared secret for the hub handshake
    pub secret: String,
    /// Number of persistent hubs to maintain
    pub tunnels: usize,
    pub logging: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 4774)),
            remote: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4775)),
            secret: String::new(),
            tunnels: 2,
            logging: LevelFilter::Info,
        }
    }
}

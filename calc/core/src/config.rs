//! Server and client configuration, loaded from TOML files with sensible
//! defaults so the binaries run without one.

use conduit::ServerOptions;
use photon::login::LoginData;
use serde_derive::{Deserialize, Serialize};
use serdeconv;
use sloggers::LoggerConfig;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 32015;

#[derive(Serialize, Deserialize)]
pub struct Auth {
    pub timeout_ms: u64,
    // Last field: arrays of tables must follow plain values in TOML.
    pub credentials: Vec<LoginData>,
}

#[derive(Serialize, Deserialize)]
pub struct Tasks {
    pub max_chunk_count: i32,
    pub min_chunk_size: i32,
    /// Worker thread count; 0 means the host's logical processor count.
    pub workers: usize,
}

#[derive(Serialize, Deserialize)]
pub struct Cache {
    pub max_cost_bytes: u64,
}

#[derive(Serialize, Deserialize)]
pub struct ServerNet {
    pub write_stall_ms: u64,
}

#[derive(Serialize, Deserialize)]
pub struct ServerConfig {
    pub auth: Auth,
    pub tasks: Tasks,
    pub cache: Cache,
    pub net: ServerNet,
    pub log: LoggerConfig,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            auth: Auth {
                timeout_ms: 3000,
                credentials: vec![LoginData::new("Chuck", "Norris")],
            },
            tasks: Tasks {
                max_chunk_count: 100,
                min_chunk_size: 100,
                workers: 0,
            },
            cache: Cache {
                max_cost_bytes: i32::max_value() as u64,
            },
            net: ServerNet { write_stall_ms: 1000 },
            log: default_log_config(),
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }

    /// Endpoint options derived from the auth and net sections.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            credentials: self.auth.credentials.clone(),
            authorization_enabled: true,
            allow_all_addresses: true,
            allowed_addresses: Vec::new(),
            auth_timeout: Duration::from_millis(self.auth.timeout_ms),
            write_stall_timeout: Duration::from_millis(self.net.write_stall_ms),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ClientNet {
    pub destination: IpAddr,
    pub port: u16,
    pub reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub wait_for_connected_ms: u64,
}

#[derive(Serialize, Deserialize)]
pub struct ClientConfig {
    pub net: ClientNet,
    pub log: LoggerConfig,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            net: ClientNet {
                destination: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: DEFAULT_PORT,
                reconnect: false,
                reconnect_interval_ms: 60_000,
                wait_for_connected_ms: 10_000,
            },
            log: default_log_config(),
        }
    }
}

impl ClientConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ClientConfig {
        serdeconv::from_toml_file(path).expect("Error loading client configuration file")
    }
}

fn default_log_config() -> LoggerConfig {
    serdeconv::from_toml_str(photon::logging::default_config_toml())
        .expect("builtin logger config must parse")
}

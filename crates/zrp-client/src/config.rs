//! Client configuration, loaded from a JSON file with defaults matching the
//! upstream zrp client.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_server_port() -> u16 {
    11433
}
fn default_local_host() -> String {
    "127.0.0.1".to_string()
}
fn default_forwarder_threads() -> i32 {
    -1
}
fn default_worker_count_initial() -> usize {
    16
}
fn default_worker_count_low() -> usize {
    8
}
fn default_worker_count_more() -> usize {
    16
}
fn default_true() -> bool {
    true
}
fn default_rlimit_nofile() -> u64 {
    65533
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpShareConfig {
    #[serde(default = "default_local_host")]
    pub local_host: String,
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub tcp_shares: HashMap<String, TcpShareConfig>,
    #[serde(default = "default_forwarder_threads")]
    pub forwarder_threads: i32,
    #[serde(default = "default_worker_count_initial")]
    pub worker_count_initial: usize,
    #[serde(default = "default_worker_count_low")]
    pub worker_count_low: usize,
    #[serde(default = "default_worker_count_more")]
    pub worker_count_more: usize,
    #[serde(default = "default_true")]
    pub access_log: bool,
    #[serde(default = "default_rlimit_nofile")]
    pub rlimit_nofile: u64,
}

impl ClientConfig {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(cfg)
    }

    pub fn server_addr(&self) -> std::io::Result<IpAddr> {
        self.server_host
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad server_host"))
    }

    /// An example config: the minimal JSON a user would actually write, or
    /// with `full` set, that same config decoded and re-encoded with every
    /// default filled in.
    pub fn example(full: bool) -> serde_json::Value {
        let minimal = serde_json::json!({
            "server_host": "192.168.0.33",
            "tcp_shares": {
                "ssh": { "local_port": 22, "remote_port": 9022 },
                "http": { "local_port": 8080, "remote_port": 8080 },
            }
        });
        if !full {
            return minimal;
        }
        let cfg: Self = serde_json::from_value(minimal).expect("example config is valid");
        serde_json::to_value(cfg).expect("config serializes")
    }
}

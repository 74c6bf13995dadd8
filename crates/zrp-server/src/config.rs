//! Server configuration, loaded from a JSON file with defaults matching the
//! upstream zrp server.

use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_server_port() -> u16 {
    11433
}
fn default_sharing_host() -> String {
    "0.0.0.0".to_string()
}
fn default_welcome() -> String {
    "welcome to zrp server".to_string()
}
fn default_forwarder_threads() -> i32 {
    -1
}
fn default_true() -> bool {
    true
}
fn default_rlimit_nofile() -> u64 {
    65533
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_sharing_host")]
    pub sharing_host: String,
    #[serde(default = "default_welcome")]
    pub welcome: String,
    #[serde(default = "default_forwarder_threads")]
    pub forwarder_threads: i32,
    #[serde(default = "default_true")]
    pub access_log: bool,
    #[serde(default = "default_rlimit_nofile")]
    pub rlimit_nofile: u64,
}

impl ServerConfig {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(cfg)
    }

    /// An example config: the minimal JSON a user would actually write, or
    /// with `full` set, that same config decoded and re-encoded with every
    /// default filled in.
    pub fn example(full: bool) -> serde_json::Value {
        let minimal = serde_json::json!({
            "server_host": "0.0.0.0",
            "server_port": 11433,
        });
        if !full {
            return minimal;
        }
        let cfg: Self = serde_json::from_value(minimal).expect("example config is valid");
        serde_json::to_value(cfg).expect("config serializes")
    }
}

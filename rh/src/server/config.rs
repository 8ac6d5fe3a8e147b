//! Server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: String,

    /// Longest accepted inbound line; longer lines get an error and are skipped
    #[serde(rename = "max-line-bytes")]
    pub max_line_bytes: usize,

    /// How long shutdown waits for connections to finish
    #[serde(rename = "shutdown-timeout-secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            max_line_bytes: 64 * 1024,
            shutdown_timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

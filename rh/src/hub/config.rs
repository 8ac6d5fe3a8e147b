//! Hub configuration

use serde::{Deserialize, Serialize};

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Buffer size for requests to the hub actor
    #[serde(rename = "channel-buffer")]
    pub channel_buffer: usize,

    /// Per-session outbound buffer; a session that fills it is evicted
    #[serde(rename = "session-buffer")]
    pub session_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 1000,
            session_buffer: 256,
        }
    }
}

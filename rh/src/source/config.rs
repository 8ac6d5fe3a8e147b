//! Upstream stream configuration

use serde::{Deserialize, Serialize};

/// Connection settings for the change-data-capture feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Comma-separated broker list
    pub brokers: String,

    pub topic: String,

    #[serde(rename = "group-id")]
    pub group_id: String,

    #[serde(rename = "client-id")]
    pub client_id: String,

    /// Fixed delay before reconnecting after the stream drops
    #[serde(rename = "retry-delay-secs")]
    pub retry_delay_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "relayhub.public.messages".to_string(),
            group_id: "relayhub".to_string(),
            client_id: "relayhub".to_string(),
            retry_delay_secs: 5,
        }
    }
}

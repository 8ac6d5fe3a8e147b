//! Wire protocol between relay clients and the server
//!
//! Newline-delimited JSON. Each message is one line, internally tagged by
//! `type`. Offsets travel as decimal strings so values past 2^53 survive
//! JSON number handling in clients.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::{Change, Event, Offset, SessionId};
use crate::hub::Outbound;

/// Messages from a client to the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Open a session; must be the first line on a connection
    Connect {
        producer_id: String,
        #[serde(default, deserialize_with = "deserialize_offset")]
        resume_offset: Offset,
    },

    /// Submit content as the session's producer
    Message { content: String },

    /// Liveness probe; answered and the connection closed
    Health,
}

/// Messages from the server to a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Welcome { session_id: SessionId },

    Event {
        content: String,
        offset: String,
        producer_id: String,
    },

    Change { payload: Value },

    Error { message: String },

    Health { status: String },
}

impl ServerMessage {
    pub fn health_ok() -> Self {
        Self::Health {
            status: "ok".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Wire form of one outbound hub message (catch-up expands to many)
    pub fn from_outbound(outbound: Outbound) -> Vec<Self> {
        match outbound {
            Outbound::CatchUp(events) => events.into_iter().map(Self::from).collect(),
            Outbound::Event(event) => vec![event.into()],
            Outbound::Change(change) => vec![change.into()],
            Outbound::Error(message) => vec![Self::Error { message }],
        }
    }

    /// Journal offset of an `Event` message
    pub fn offset(&self) -> Option<Offset> {
        match self {
            Self::Event { offset, .. } => offset.parse().ok(),
            _ => None,
        }
    }
}

impl From<Event> for ServerMessage {
    fn from(event: Event) -> Self {
        Self::Event {
            content: event.content,
            offset: event.offset.to_string(),
            producer_id: event.producer_id,
        }
    }
}

impl From<Change> for ServerMessage {
    fn from(change: Change) -> Self {
        Self::Change { payload: change.payload }
    }
}

/// Accept an offset as a JSON number or a decimal string
fn deserialize_offset<'de, D>(deserializer: D) -> Result<Offset, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid offset: {:?}", s))),
    }
}

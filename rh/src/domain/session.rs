//! Session domain type
//!
//! A session is one connected viewer. It is created on connect, owned by the
//! hub's registry, and dropped on disconnect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::Offset;

/// Opaque unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new time-ordered session ID
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, catch-up not yet delivered
    #[default]
    Connecting,
    /// Receiving live fan-out
    Active,
    /// Terminal
    Disconnected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A connected viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub producer_id: String,
    /// Last offset the viewer has seen (0 = from the start)
    pub resume_offset: Offset,
    pub connected_at: DateTime<Utc>,
    pub state: SessionState,
}

impl Session {
    /// Create a session in the `Connecting` state
    pub fn new(producer_id: impl Into<String>, resume_offset: Offset) -> Self {
        Self {
            id: SessionId::new(),
            producer_id: producer_id.into(),
            resume_offset,
            connected_at: Utc::now(),
            state: SessionState::Connecting,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Move to `Active`. Returns false if the session was not `Connecting`.
    pub fn activate(&mut self) -> bool {
        if self.state != SessionState::Connecting {
            return false;
        }
        self.state = SessionState::Active;
        true
    }

    /// Move to the terminal `Disconnected` state
    pub fn close(&mut self) {
        self.state = SessionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_starts_connecting() {
        let session = Session::new("alice", 0);
        assert_eq!(session.state, SessionState::Connecting);
        assert_eq!(session.producer_id, "alice");
        assert!(!session.is_active());
    }

    #[test]
    fn test_session_lifecycle() {
        let mut session = Session::new("alice", 3);
        assert!(session.activate());
        assert!(session.is_active());

        // Only Connecting -> Active is allowed
        assert!(!session.activate());

        session.close();
        assert_eq!(session.state, SessionState::Disconnected);
        assert!(!session.activate());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_id_parse_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Connecting.to_string(), "connecting");
        assert_eq!(SessionState::Active.to_string(), "active");
        assert_eq!(SessionState::Disconnected.to_string(), "disconnected");
    }
}

//! Message types for the hub

use thiserror::Error;
use tokio::sync::oneshot;

use super::handle::Subscription;
use crate::domain::{Broadcast, Change, Event, Offset, Session, SessionId};
use crate::journal::JournalError;

/// Errors from hub operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Hub is shut down")]
    Closed,
}

/// Messages delivered to a single session
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// One page of catch-up replay, ascending by offset
    CatchUp(Vec<Event>),
    /// Live chat event
    Event(Event),
    /// Live change from the upstream feed
    Change(Change),
    /// Error addressed to this session only
    Error(String),
}

impl From<Broadcast> for Outbound {
    fn from(broadcast: Broadcast) -> Self {
        match broadcast {
            Broadcast::Event(event) => Self::Event(event),
            Broadcast::Change(change) => Self::Change(change),
        }
    }
}

/// Requests to the hub actor
#[derive(Debug)]
pub enum HubRequest {
    /// Register a new session
    Connect {
        producer_id: String,
        resume_offset: Offset,
        reply: oneshot::Sender<Subscription>,
    },

    /// Catch-up finished streaming for a connecting session (internal)
    CatchUpComplete {
        session_id: SessionId,
        progress: CatchUpProgress,
    },

    /// Remove a session
    Disconnect { session_id: SessionId },

    /// Fan out to every active session
    Publish { broadcast: Broadcast },

    /// Deliver an error to one session
    Error { session_id: SessionId, message: String },

    /// Snapshot of registered sessions
    ListSessions { reply: oneshot::Sender<Vec<Session>> },

    /// Get current metrics
    GetMetrics { reply: oneshot::Sender<HubMetrics> },

    /// Stop the hub; all session channels close
    Shutdown,
}

/// What a catch-up task delivered before it stopped
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CatchUpProgress {
    /// Offset of the last catch-up event handed to the session
    pub last_offset: Option<Offset>,
    pub events: u64,
    pub pages: u64,
    /// Read failure that ended the catch-up early
    pub error: Option<JournalError>,
}

/// Hub metrics for observability
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct HubMetrics {
    pub connecting_sessions: usize,
    pub active_sessions: usize,
    pub events_published: u64,
    pub changes_published: u64,
    pub messages_delivered: u64,
    pub catch_up_events: u64,
    pub duplicates_suppressed: u64,
    pub sessions_evicted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_from_broadcast() {
        let event = Event::new(3, "hi", "alice");
        assert_eq!(Outbound::from(Broadcast::Event(event.clone())), Outbound::Event(event));

        let change = Change::new(json!({"op": "u"}));
        assert_eq!(Outbound::from(Broadcast::Change(change.clone())), Outbound::Change(change));
    }
}

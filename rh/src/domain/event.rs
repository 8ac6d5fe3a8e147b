//! Event and change types

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Position of an event in the journal. Zero means "before the first event".
pub type Offset = u64;

/// A message appended to the journal
///
/// The offset is assigned by the journal at append time and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub offset: Offset,
    pub content: String,
    pub producer_id: String,
}

impl Event {
    pub fn new(offset: Offset, content: impl Into<String>, producer_id: impl Into<String>) -> Self {
        Self {
            offset,
            content: content.into(),
            producer_id: producer_id.into(),
        }
    }
}

/// A change record relayed from an upstream CDC stream
///
/// Upstream owns ordering and retention, so a change carries no local offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub payload: Value,
}

impl Change {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    /// CDC operation code (`c`, `u`, `d`, `r`) when the payload carries one
    pub fn op(&self) -> Option<&str> {
        self.payload.get("op").and_then(Value::as_str)
    }
}

/// Anything the hub fans out
#[derive(Debug, Clone, PartialEq)]
pub enum Broadcast {
    Event(Event),
    Change(Change),
}

impl Broadcast {
    /// Journal offset, if this broadcast came from the journal
    pub fn offset(&self) -> Option<Offset> {
        match self {
            Self::Event(event) => Some(event.offset),
            Self::Change(_) => None,
        }
    }
}

impl From<Event> for Broadcast {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

impl From<Change> for Broadcast {
    fn from(change: Change) -> Self {
        Self::Change(change)
    }
}

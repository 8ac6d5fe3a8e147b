//! Domain types for relayhub
//!
//! Core types shared by the journal, the hub and the transport:
//! [`Event`] (an offset-stamped chat message), [`Change`] (a relayed CDC payload)
//! and [`Session`] (one connected viewer).

mod event;
mod session;

pub use event::{Broadcast, Change, Event, Offset};
pub use session::{Session, SessionId, SessionState};

//! relayhub - real-time message relay with durable catch-up
//!
//! Events are appended to a [`journal`] (which assigns offsets), fanned out
//! by the [`hub`] to connected sessions, and replayed from a session's resume
//! offset when it (re)connects. A second mode relays an upstream CDC stream
//! without local storage.

pub mod cli;
pub mod client;
pub mod config;
pub mod domain;
pub mod hub;
pub mod journal;
pub mod protocol;
pub mod server;
pub mod source;

pub use client::RelayClient;
pub use config::{Config, ConfigLoad, JournalBackend, JournalConfig};
pub use domain::{Broadcast, Change, Event, Offset, Session, SessionId, SessionState};
pub use hub::{Hub, HubConfig, HubHandle, Outbound};
pub use journal::{Journal, JournalError, MemoryJournal, SqliteJournal};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{Server, ServerConfig};
pub use source::{CdcSubscriber, DirectWriter, SourceError, UpstreamError, UpstreamStream};

//! Durable, append-only event journal
//!
//! The journal assigns offsets and stores chat events so that reconnecting
//! viewers can catch up from their last seen offset. Two backends:
//!
//! - [`SqliteJournal`] - actor-owned SQLite connection (`messages` table)
//! - [`MemoryJournal`] - in-process store for tests and ephemeral relays
//!
//! Both guarantee that offsets are strictly increasing in append order and
//! that an append is visible to `read_since` before `append` returns.

mod memory;
mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Event, Offset};

pub use memory::MemoryJournal;
pub use sqlite::{SqliteJournal, SqliteOptions};

/// Default number of events returned by one `read_since` call
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Errors from journal operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JournalError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<rusqlite::Error> for JournalError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

/// Append-only ordered event store
#[async_trait]
pub trait Journal: Send + Sync {
    /// Assign the next offset, persist the event, and return it
    ///
    /// On error the event must be assumed NOT persisted.
    async fn append(&self, content: &str, producer_id: &str) -> Result<Event, JournalError>;

    /// Events with `offset > after`, ascending, at most [`Journal::batch_size`]
    ///
    /// Returns an empty vec when there is nothing newer. Callers needing more
    /// call again with the last returned offset.
    async fn read_since(&self, after: Offset) -> Result<Vec<Event>, JournalError>;

    /// Connectivity probe, used to fail fast at startup
    async fn check(&self) -> Result<(), JournalError>;

    /// Upper bound on the length of one `read_since` result
    fn batch_size(&self) -> usize;

    /// Release the underlying store once queued operations have finished
    async fn close(&self) {}
}

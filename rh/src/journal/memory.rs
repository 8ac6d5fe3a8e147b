//! In-memory journal

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{DEFAULT_BATCH_SIZE, Journal, JournalError};
use crate::domain::{Event, Offset};

struct Inner {
    events: Vec<Event>,
    next_offset: Offset,
    available: bool,
}

/// Journal kept in process memory
///
/// Offsets start at 1. Contents are lost when the process exits.
pub struct MemoryJournal {
    inner: Mutex<Inner>,
    batch_size: usize,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::with_batch_size(DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        debug!(batch_size, "MemoryJournal::with_batch_size: called");
        Self {
            inner: Mutex::new(Inner {
                events: Vec::new(),
                next_offset: 1,
                available: true,
            }),
            batch_size: batch_size.max(1),
        }
    }

    /// Mark the store reachable or unreachable
    ///
    /// While unavailable every operation fails with `StorageUnavailable`.
    pub fn set_available(&self, available: bool) {
        debug!(available, "MemoryJournal::set_available: called");
        self.lock().available = available;
    }

    /// Number of stored events
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Every mutation is a single push, so a poisoned guard is still consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, content: &str, producer_id: &str) -> Result<Event, JournalError> {
        debug!(%producer_id, "MemoryJournal::append: called");
        let mut inner = self.lock();
        if !inner.available {
            return Err(JournalError::StorageUnavailable("memory journal offline".to_string()));
        }
        let event = Event::new(inner.next_offset, content, producer_id);
        inner.next_offset += 1;
        inner.events.push(event.clone());
        Ok(event)
    }

    async fn read_since(&self, after: Offset) -> Result<Vec<Event>, JournalError> {
        debug!(after, "MemoryJournal::read_since: called");
        let inner = self.lock();
        if !inner.available {
            return Err(JournalError::StorageUnavailable("memory journal offline".to_string()));
        }
        let start = inner.events.partition_point(|e| e.offset <= after);
        Ok(inner.events[start..].iter().take(self.batch_size).cloned().collect())
    }

    async fn check(&self) -> Result<(), JournalError> {
        if self.lock().available {
            Ok(())
        } else {
            Err(JournalError::StorageUnavailable("memory journal offline".to_string()))
        }
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

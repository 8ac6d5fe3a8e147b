//! Direct-write adapter: persist first, then fan out

use std::sync::Arc;

use tracing::{debug, warn};

use super::SourceError;
use crate::domain::Event;
use crate::hub::HubHandle;
use crate::journal::Journal;

/// Accepts content from producers and makes it durable before anyone sees it
#[derive(Clone)]
pub struct DirectWriter {
    journal: Arc<dyn Journal>,
    hub: HubHandle,
}

impl DirectWriter {
    pub fn new(journal: Arc<dyn Journal>, hub: HubHandle) -> Self {
        Self { journal, hub }
    }

    /// Append `content` and broadcast the resulting event
    ///
    /// Nothing is published unless the append succeeded. The returned event
    /// carries the offset the journal assigned.
    pub async fn submit(&self, content: &str, producer_id: &str) -> Result<Event, SourceError> {
        debug!(%producer_id, len = content.len(), "DirectWriter::submit: called");

        let content = content.trim();
        if content.is_empty() {
            return Err(SourceError::EmptyContent);
        }

        let event = self
            .journal
            .append(content, producer_id)
            .await
            .map_err(SourceError::PersistFailure)?;

        if let Err(e) = self.hub.publish(event.clone()).await {
            warn!(offset = event.offset, error = %e, "Event persisted but hub is gone");
        }

        Ok(event)
    }
}

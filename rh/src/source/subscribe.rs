//! Subscribe adapter: relay change records from an upstream stream

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::UpstreamError;
use crate::domain::Change;
use crate::hub::HubHandle;

/// A consumer of raw upstream records
#[async_trait]
pub trait UpstreamStream: Send {
    /// Open the stream, positioned at the earliest retained record
    async fn connect(&mut self) -> Result<(), UpstreamError>;

    /// Next raw record; `Ok(None)` once the stream has ended
    async fn next_record(&mut self) -> Result<Option<Vec<u8>>, UpstreamError>;

    /// Release the upstream subscription
    async fn disconnect(&mut self);
}

/// CDC envelope; only `payload` is relayed
#[derive(Debug, Deserialize)]
struct CdcEnvelope {
    #[serde(default)]
    payload: Option<Value>,
}

/// Parse one raw record into a change
///
/// `Ok(None)` means the envelope had no payload (tombstones, heartbeats).
pub fn parse_record(bytes: &[u8]) -> Result<Option<Change>, UpstreamError> {
    let envelope: CdcEnvelope =
        serde_json::from_slice(bytes).map_err(|e| UpstreamError::MalformedRecord(e.to_string()))?;
    Ok(envelope.payload.map(Change::new))
}

/// Counters for one subscriber run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriberStats {
    pub received: u64,
    pub published: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub reconnects: u64,
}

/// Why the read loop stopped
enum Stop {
    Cancelled,
    Ended,
    HubClosed,
    Lost,
}

/// Supervised relay from an [`UpstreamStream`] into the hub
pub struct CdcSubscriber<S: UpstreamStream> {
    stream: S,
    hub: HubHandle,
    retry_delay: Duration,
    stats: SubscriberStats,
}

impl<S: UpstreamStream> CdcSubscriber<S> {
    pub fn new(stream: S, hub: HubHandle, retry_delay: Duration) -> Self {
        Self {
            stream,
            hub,
            retry_delay,
            stats: SubscriberStats::default(),
        }
    }

    /// Consume until cancelled, the stream ends, or the hub goes away
    ///
    /// Connection loss is retried after a fixed delay, indefinitely. The
    /// upstream subscription is always released before returning.
    pub async fn run(mut self, cancel: CancellationToken) -> SubscriberStats {
        info!(retry_delay = ?self.retry_delay, "CDC subscriber started");

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.stream.connect() => result,
            };

            let stop = match connected {
                Ok(()) => {
                    info!("Connected to upstream");
                    self.read_loop(&cancel).await
                }
                Err(e) => {
                    warn!(error = %e, "Upstream connect failed");
                    Stop::Lost
                }
            };

            match stop {
                Stop::Cancelled => break,
                Stop::Ended => {
                    info!("Upstream stream ended");
                    break;
                }
                Stop::HubClosed => {
                    info!("Hub closed, stopping subscriber");
                    break;
                }
                Stop::Lost => {
                    self.stream.disconnect().await;
                    self.stats.reconnects += 1;
                    debug!(delay = ?self.retry_delay, "Waiting before reconnect");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }

        self.stream.disconnect().await;
        info!(?self.stats, "CDC subscriber stopped");
        self.stats
    }

    async fn read_loop(&mut self, cancel: &CancellationToken) -> Stop {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Stop::Cancelled,
                next = self.stream.next_record() => next,
            };

            match next {
                Ok(Some(bytes)) => {
                    self.stats.received += 1;
                    if !self.relay(&bytes).await {
                        return Stop::HubClosed;
                    }
                }
                Ok(None) => return Stop::Ended,
                Err(UpstreamError::MalformedRecord(reason)) => {
                    warn!(%reason, "Dropping malformed upstream record");
                    self.stats.malformed += 1;
                }
                Err(UpstreamError::ConnectionLost(reason)) => {
                    warn!(%reason, "Upstream connection lost");
                    return Stop::Lost;
                }
            }
        }
    }

    /// Returns false once the hub is gone
    async fn relay(&mut self, bytes: &[u8]) -> bool {
        match parse_record(bytes) {
            Ok(Some(change)) => {
                if self.hub.publish_change(change).await.is_err() {
                    return false;
                }
                self.stats.published += 1;
            }
            Ok(None) => {
                debug!("Upstream record has no payload, dropping");
                self.stats.dropped += 1;
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed upstream record");
                self.stats.malformed += 1;
            }
        }
        true
    }
}

//! HubHandle - client interface to the hub actor

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::messages::{HubError, HubMetrics, HubRequest, Outbound};
use crate::domain::{Broadcast, Change, Event, Offset, Session, SessionId};

/// Cloneable handle for talking to the hub
///
/// All operations are requests on the hub's channel; they fail with
/// [`HubError::Closed`] once the hub has shut down.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubRequest>,
}

impl HubHandle {
    pub(crate) fn new(tx: mpsc::Sender<HubRequest>) -> Self {
        Self { tx }
    }

    async fn send(&self, req: HubRequest) -> Result<(), HubError> {
        self.tx.send(req).await.map_err(|_| HubError::Closed)
    }

    /// Register a session and get its outbound stream
    ///
    /// The session starts `Connecting`; its catch-up pages (if any) are the
    /// first messages it receives.
    pub async fn connect(&self, producer_id: &str, resume_offset: Offset) -> Result<Subscription, HubError> {
        debug!(%producer_id, resume_offset, "HubHandle::connect: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubRequest::Connect {
            producer_id: producer_id.to_string(),
            resume_offset,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| HubError::Closed)
    }

    /// Remove a session; nothing more is delivered to it
    pub async fn disconnect(&self, session_id: SessionId) -> Result<(), HubError> {
        debug!(%session_id, "HubHandle::disconnect: called");
        self.send(HubRequest::Disconnect { session_id }).await
    }

    /// Fan out a journaled event
    pub async fn publish(&self, event: Event) -> Result<(), HubError> {
        debug!(offset = event.offset, "HubHandle::publish: called");
        self.send(HubRequest::Publish {
            broadcast: Broadcast::Event(event),
        })
        .await
    }

    /// Fan out an upstream change
    pub async fn publish_change(&self, change: Change) -> Result<(), HubError> {
        debug!(op = ?change.op(), "HubHandle::publish_change: called");
        self.send(HubRequest::Publish {
            broadcast: Broadcast::Change(change),
        })
        .await
    }

    /// Send an error to one session only
    pub async fn error(&self, session_id: SessionId, message: impl Into<String>) -> Result<(), HubError> {
        let message = message.into();
        debug!(%session_id, %message, "HubHandle::error: called");
        self.send(HubRequest::Error { session_id, message }).await
    }

    /// Snapshot of registered sessions
    pub async fn sessions(&self) -> Result<Vec<Session>, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubRequest::ListSessions { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn metrics(&self) -> Result<HubMetrics, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubRequest::GetMetrics { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| HubError::Closed)
    }

    /// Stop the hub
    pub async fn shutdown(&self) -> Result<(), HubError> {
        debug!("HubHandle::shutdown: called");
        self.send(HubRequest::Shutdown).await
    }
}

/// A registered session's receiving end
#[derive(Debug)]
pub struct Subscription {
    session: Session,
    rx: mpsc::Receiver<Outbound>,
}

impl Subscription {
    pub(crate) fn new(session: Session, rx: mpsc::Receiver<Outbound>) -> Self {
        Self { session, rx }
    }

    pub fn id(&self) -> SessionId {
        self.session.id
    }

    /// The session as registered (state at connect time)
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Next message for this session; `None` once the hub dropped it
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }
}

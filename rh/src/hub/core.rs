//! Main hub task implementation

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::HubConfig;
use super::handle::{HubHandle, Subscription};
use super::messages::{CatchUpProgress, HubMetrics, HubRequest, Outbound};
use crate::domain::{Broadcast, Offset, Session, SessionId, SessionState};
use crate::journal::Journal;

/// Registry entry for one session
struct SessionEntry {
    session: Session,
    tx: mpsc::Sender<Outbound>,
    /// Live broadcasts that arrived while catch-up was in flight
    pending: Vec<Broadcast>,
    /// Last catch-up offset actually delivered; live events at or below it are duplicates
    watermark: Option<Offset>,
    /// Stops the catch-up task when the entry goes away
    catch_up: CancellationToken,
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        self.catch_up.cancel();
    }
}

/// Outcome of one delivery attempt
enum Delivery {
    Sent,
    Gone,
}

impl SessionEntry {
    fn deliver(&self, msg: Outbound, metrics: &mut HubMetrics) -> Delivery {
        match self.tx.try_send(msg) {
            Ok(()) => {
                metrics.messages_delivered += 1;
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %self.session.id, "Session buffer full, evicting");
                metrics.sessions_evicted += 1;
                Delivery::Gone
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.session.id, "Session channel closed");
                Delivery::Gone
            }
        }
    }

    /// Deliver a live broadcast unless this session already has it
    fn deliver_live(&self, broadcast: Broadcast, metrics: &mut HubMetrics) -> Delivery {
        if let (Some(offset), Some(watermark)) = (broadcast.offset(), self.watermark)
            && offset <= watermark
        {
            debug!(session_id = %self.session.id, offset, "Suppressing duplicate");
            metrics.duplicates_suppressed += 1;
            return Delivery::Sent;
        }
        self.deliver(broadcast.into(), metrics)
    }
}

/// The hub owns the session registry and performs all fan-out
pub struct Hub {
    config: HubConfig,
    tx: mpsc::Sender<HubRequest>,
    rx: mpsc::Receiver<HubRequest>,
    /// Source of catch-up reads; `None` for relayed feeds with no local history
    journal: Option<Arc<dyn Journal>>,
}

impl Hub {
    /// Create a hub without catch-up (sessions go active immediately)
    pub fn new(config: HubConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_buffer.max(1));
        Self {
            config,
            tx,
            rx,
            journal: None,
        }
    }

    /// Create a hub that replays journal events to connecting sessions
    pub fn with_journal(config: HubConfig, journal: Arc<dyn Journal>) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_buffer.max(1));
        Self {
            config,
            tx,
            rx,
            journal: Some(journal),
        }
    }

    /// Get a handle for talking to this hub
    pub fn handle(&self) -> HubHandle {
        HubHandle::new(self.tx.clone())
    }

    /// Get a raw sender (for components that speak `HubRequest` directly)
    pub fn sender(&self) -> mpsc::Sender<HubRequest> {
        self.tx.clone()
    }

    /// Run the hub task
    ///
    /// This consumes the hub and runs until shutdown is requested.
    pub async fn run(mut self) {
        let hub_tx = self.tx.clone();
        let journal = self.journal.take();

        let mut registry: HashMap<SessionId, SessionEntry> = HashMap::new();
        let mut metrics = HubMetrics::default();
        let session_buffer = self.config.session_buffer.max(1);

        info!(catch_up = journal.is_some(), "Hub started");

        while let Some(req) = self.rx.recv().await {
            match req {
                HubRequest::Connect {
                    producer_id,
                    resume_offset,
                    reply,
                } => {
                    let mut session = Session::new(producer_id, resume_offset);
                    let (tx, rx) = mpsc::channel(session_buffer);
                    let session_id = session.id;

                    if journal.is_none() {
                        session.activate();
                    }

                    debug!(%session_id, producer_id = %session.producer_id, resume_offset, state = %session.state, "Registering session");

                    if reply.send(Subscription::new(session.clone(), rx)).is_err() {
                        debug!(%session_id, "Connect caller went away before registration");
                        continue;
                    }

                    let catch_up = CancellationToken::new();
                    if let Some(ref journal) = journal {
                        let journal = Arc::clone(journal);
                        let hub_tx = hub_tx.clone();
                        let session_tx = tx.clone();
                        let cancel = catch_up.clone();
                        tokio::spawn(async move {
                            let progress = stream_catch_up(journal.as_ref(), resume_offset, &session_tx, &cancel).await;
                            drop(session_tx);
                            let _ = hub_tx
                                .send(HubRequest::CatchUpComplete { session_id, progress })
                                .await;
                        });
                    }

                    registry.insert(
                        session_id,
                        SessionEntry {
                            session,
                            tx,
                            pending: Vec::new(),
                            watermark: None,
                            catch_up,
                        },
                    );
                    update_counts(&registry, &mut metrics);
                }

                HubRequest::CatchUpComplete { session_id, progress } => {
                    let Some(entry) = registry.get_mut(&session_id) else {
                        debug!(%session_id, "Catch-up finished for a session that already left");
                        continue;
                    };

                    entry.watermark = progress.last_offset;
                    metrics.catch_up_events += progress.events;
                    metrics.messages_delivered += progress.pages;
                    debug!(
                        %session_id,
                        events = progress.events,
                        pending = entry.pending.len(),
                        watermark = ?entry.watermark,
                        "Catch-up delivered"
                    );

                    let mut alive = true;
                    if let Some(e) = progress.error {
                        warn!(%session_id, error = %e, "Catch-up read failed");
                        alive = matches!(
                            entry.deliver(Outbound::Error("Failed to load message history".to_string()), &mut metrics),
                            Delivery::Sent
                        );
                    }

                    let pending = std::mem::take(&mut entry.pending);
                    for broadcast in pending {
                        if !alive {
                            break;
                        }
                        alive = matches!(entry.deliver_live(broadcast, &mut metrics), Delivery::Sent);
                    }

                    if alive {
                        entry.session.activate();
                        debug!(%session_id, "Session active");
                    } else {
                        registry.remove(&session_id);
                    }
                    update_counts(&registry, &mut metrics);
                }

                HubRequest::Disconnect { session_id } => {
                    if let Some(mut entry) = registry.remove(&session_id) {
                        entry.session.close();
                        debug!(%session_id, "Session disconnected");
                    }
                    update_counts(&registry, &mut metrics);
                }

                HubRequest::Publish { broadcast } => {
                    match broadcast {
                        Broadcast::Event(ref event) => {
                            metrics.events_published += 1;
                            debug!(offset = event.offset, sessions = registry.len(), "Broadcasting event");
                        }
                        Broadcast::Change(ref change) => {
                            metrics.changes_published += 1;
                            debug!(op = ?change.op(), sessions = registry.len(), "Broadcasting change");
                        }
                    }

                    let mut gone = Vec::new();
                    for (session_id, entry) in registry.iter_mut() {
                        match entry.session.state {
                            // Buffered events must fit the drained session buffer at activation
                            SessionState::Connecting if entry.pending.len() >= session_buffer => {
                                warn!(%session_id, "Session fell behind during catch-up, evicting");
                                metrics.sessions_evicted += 1;
                                gone.push(*session_id);
                            }
                            SessionState::Connecting => entry.pending.push(broadcast.clone()),
                            SessionState::Active => {
                                if let Delivery::Gone = entry.deliver_live(broadcast.clone(), &mut metrics) {
                                    gone.push(*session_id);
                                }
                            }
                            SessionState::Disconnected => {}
                        }
                    }

                    if !gone.is_empty() {
                        for session_id in gone {
                            registry.remove(&session_id);
                        }
                        update_counts(&registry, &mut metrics);
                    }
                }

                HubRequest::Error { session_id, message } => {
                    let Some(entry) = registry.get(&session_id) else {
                        debug!(%session_id, "Error for unknown session dropped");
                        continue;
                    };
                    if let Delivery::Gone = entry.deliver(Outbound::Error(message), &mut metrics) {
                        registry.remove(&session_id);
                        update_counts(&registry, &mut metrics);
                    }
                }

                HubRequest::ListSessions { reply } => {
                    let sessions = registry.values().map(|entry| entry.session.clone()).collect();
                    let _ = reply.send(sessions);
                }

                HubRequest::GetMetrics { reply } => {
                    let _ = reply.send(metrics.clone());
                }

                HubRequest::Shutdown => {
                    info!(sessions = registry.len(), "Hub shutting down");
                    break;
                }
            }
        }

        info!("Hub stopped");
    }
}

fn update_counts(registry: &HashMap<SessionId, SessionEntry>, metrics: &mut HubMetrics) {
    metrics.connecting_sessions = registry
        .values()
        .filter(|entry| entry.session.state == SessionState::Connecting)
        .count();
    metrics.active_sessions = registry.values().filter(|entry| entry.session.is_active()).count();
}

/// Stream everything after `from` to one session, one page at a time
///
/// Each page waits for room in the session buffer, so a slow reader slows its
/// own catch-up and nothing else. Before reporting completion the task waits
/// for the buffer to drain, leaving room for the live events held meanwhile.
async fn stream_catch_up(
    journal: &dyn Journal,
    from: Offset,
    tx: &mpsc::Sender<Outbound>,
    cancel: &CancellationToken,
) -> CatchUpProgress {
    let mut progress = CatchUpProgress::default();
    let mut cursor = from;

    loop {
        let page = tokio::select! {
            _ = cancel.cancelled() => return progress,
            page = journal.read_since(cursor) => page,
        };
        let page = match page {
            Ok(page) => page,
            Err(e) => {
                progress.error = Some(e);
                break;
            }
        };

        let full = page.len() >= journal.batch_size();
        let Some(last) = page.last().map(|event| event.offset) else {
            break;
        };
        let count = page.len() as u64;

        tokio::select! {
            _ = cancel.cancelled() => return progress,
            sent = tx.send(Outbound::CatchUp(page)) => {
                if sent.is_err() {
                    return progress;
                }
            }
        }

        cursor = last;
        progress.last_offset = Some(last);
        progress.events += count;
        progress.pages += 1;
        if !full {
            break;
        }
    }

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tx.reserve_many(tx.max_capacity()) => {}
    }
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Change, Event};
    use crate::hub::HubError;
    use crate::journal::{JournalError, MemoryJournal};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    /// Journal whose reads take their snapshot, then wait for `release`
    struct GatedJournal {
        inner: MemoryJournal,
        snapshot_taken: Notify,
        gate: Semaphore,
    }

    impl GatedJournal {
        fn new() -> Self {
            Self {
                inner: MemoryJournal::new(),
                snapshot_taken: Notify::new(),
                gate: Semaphore::new(0),
            }
        }

        fn release(&self) {
            self.gate.add_permits(1);
        }
    }

    #[async_trait]
    impl Journal for GatedJournal {
        async fn append(&self, content: &str, producer_id: &str) -> Result<Event, JournalError> {
            self.inner.append(content, producer_id).await
        }

        async fn read_since(&self, after: Offset) -> Result<Vec<Event>, JournalError> {
            let page = self.inner.read_since(after).await;
            self.snapshot_taken.notify_one();
            let _permit = self.gate.acquire().await;
            page
        }

        async fn check(&self) -> Result<(), JournalError> {
            self.inner.check().await
        }

        fn batch_size(&self) -> usize {
            self.inner.batch_size()
        }
    }

    fn offsets(msg: &Outbound) -> Vec<Offset> {
        match msg {
            Outbound::CatchUp(events) => events.iter().map(|e| e.offset).collect(),
            Outbound::Event(event) => vec![event.offset],
            _ => vec![],
        }
    }

    async fn wait_until_active(handle: &HubHandle) {
        for _ in 0..200 {
            let sessions = handle.sessions().await.unwrap();
            if sessions.iter().all(|s| s.is_active()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sessions never became active");
    }

    async fn drain(sub: &mut Subscription) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_hub_connect_disconnect() {
        let hub = Hub::new(HubConfig::default());
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        let sub = handle.connect("alice", 0).await.unwrap();
        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.active_sessions, 1);

        handle.disconnect(sub.id()).await.unwrap();
        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.active_sessions, 0);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_reaches_all_active_sessions() {
        let hub = Hub::new(HubConfig::default());
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        let mut a = handle.connect("alice", 0).await.unwrap();
        let mut b = handle.connect("bob", 0).await.unwrap();

        handle.publish_change(Change::new(json!({"op": "c"}))).await.unwrap();

        for sub in [&mut a, &mut b] {
            match sub.recv().await.unwrap() {
                Outbound::Change(change) => assert_eq!(change.op(), Some("c")),
                other => panic!("Expected Change, got {:?}", other),
            }
        }

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnected_session_receives_nothing() {
        let hub = Hub::new(HubConfig::default());
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        let mut a = handle.connect("alice", 0).await.unwrap();
        handle.disconnect(a.id()).await.unwrap();
        handle.publish(Event::new(1, "hello", "bob")).await.unwrap();

        // Channel closes once the hub drops the entry, with nothing delivered
        assert_eq!(a.recv().await, None);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_goes_only_to_target() {
        let hub = Hub::new(HubConfig::default());
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        let mut a = handle.connect("alice", 0).await.unwrap();
        let mut b = handle.connect("bob", 0).await.unwrap();

        handle.error(a.id(), "Failed to send message").await.unwrap();

        assert_eq!(a.recv().await, Some(Outbound::Error("Failed to send message".to_string())));
        assert!(drain(&mut b).await.is_empty());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_catch_up_from_resume_offset() {
        let journal = Arc::new(MemoryJournal::new());
        for i in 1..=5 {
            journal.append(&format!("m{}", i), "alice").await.unwrap();
        }

        let hub = Hub::with_journal(HubConfig::default(), journal.clone());
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        let mut sub = handle.connect("bob", 2).await.unwrap();
        let first = sub.recv().await.unwrap();
        assert_eq!(offsets(&first), vec![3, 4, 5]);

        wait_until_active(&handle).await;
        let sessions = handle.sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, SessionState::Active);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_catch_up_paginates_past_batch_size() {
        let journal = Arc::new(MemoryJournal::with_batch_size(3));
        for i in 1..=10 {
            journal.append(&format!("m{}", i), "alice").await.unwrap();
        }

        let hub = Hub::with_journal(HubConfig::default(), journal.clone());
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        let mut sub = handle.connect("bob", 0).await.unwrap();
        let pages = drain(&mut sub).await;
        assert_eq!(pages.len(), 4);
        assert!(pages.iter().all(|page| matches!(page, Outbound::CatchUp(_))));
        let received: Vec<Offset> = pages.iter().flat_map(offsets).collect();
        assert_eq!(received, (1..=10).collect::<Vec<_>>());

        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.catch_up_events, 10);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_live_event_during_catch_up_is_not_duplicated() {
        let journal = Arc::new(MemoryJournal::new());
        journal.append("one", "alice").await.unwrap();

        let hub = Hub::with_journal(HubConfig::default(), journal.clone());
        let sender = hub.sender();
        let handle = hub.handle();

        // Queue the connect and a publish of an event the catch-up will also
        // read, before the hub starts processing.
        let connect = tokio::spawn({
            let handle = handle.clone();
            async move { handle.connect("bob", 0).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let two = journal.append("two", "alice").await.unwrap();
        sender
            .send(HubRequest::Publish {
                broadcast: Broadcast::Event(two),
            })
            .await
            .unwrap();

        let task = tokio::spawn(hub.run());
        let mut sub = connect.await.unwrap();

        let received: Vec<Offset> = drain(&mut sub).await.iter().flat_map(offsets).collect();
        assert_eq!(received, vec![1, 2]);

        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.duplicates_suppressed, 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_live_event_during_catch_up_follows_it() {
        let journal = Arc::new(GatedJournal::new());
        journal.append("one", "alice").await.unwrap();
        journal.append("two", "alice").await.unwrap();

        let hub = Hub::with_journal(HubConfig::default(), journal.clone());
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        let mut sub = handle.connect("bob", 0).await.unwrap();
        journal.snapshot_taken.notified().await;

        // Appended after the catch-up read, published while bob is connecting
        let three = journal.append("three", "carol").await.unwrap();
        handle.publish(three.clone()).await.unwrap();
        assert_eq!(handle.metrics().await.unwrap().connecting_sessions, 1);
        assert!(sub.try_recv().is_none());

        journal.release();

        let received = drain(&mut sub).await;
        assert_eq!(received.len(), 2);
        assert_eq!(offsets(&received[0]), vec![1, 2]);
        assert!(matches!(received[0], Outbound::CatchUp(_)));
        assert_eq!(received[1], Outbound::Event(three));

        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.duplicates_suppressed, 0);
        assert_eq!(metrics.active_sessions, 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_past_journal_end_still_gets_new_events() {
        let journal = Arc::new(MemoryJournal::new());
        journal.append("one", "alice").await.unwrap();
        journal.append("two", "alice").await.unwrap();

        let hub = Hub::with_journal(HubConfig::default(), journal.clone());
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        // Cursor from a journal that has since been reset
        let mut sub = handle.connect("bob", 10).await.unwrap();
        wait_until_active(&handle).await;

        let three = journal.append("three", "alice").await.unwrap();
        handle.publish(three.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
        assert_eq!(received, Some(Outbound::Event(three)));
        assert_eq!(handle.metrics().await.unwrap().duplicates_suppressed, 0);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_held_too_long_in_catch_up_is_evicted() {
        let journal = Arc::new(GatedJournal::new());
        journal.append("one", "alice").await.unwrap();

        let config = HubConfig {
            session_buffer: 2,
            ..Default::default()
        };
        let hub = Hub::with_journal(config, journal.clone());
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        let mut sub = handle.connect("bob", 0).await.unwrap();
        journal.snapshot_taken.notified().await;

        for _ in 0..3 {
            let event = journal.append("live", "carol").await.unwrap();
            handle.publish(event).await.unwrap();
        }

        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.sessions_evicted, 1);
        assert_eq!(metrics.connecting_sessions, 0);

        // Eviction cancels the blocked catch-up, which closes the session
        let rest = tokio::time::timeout(Duration::from_secs(1), async {
            let mut rest = Vec::new();
            while let Some(msg) = sub.recv().await {
                rest.push(msg);
            }
            rest
        })
        .await
        .unwrap();
        assert!(rest.is_empty());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_catch_up_failure_reports_error_and_activates() {
        let journal = Arc::new(MemoryJournal::new());
        journal.set_available(false);

        let hub = Hub::with_journal(HubConfig::default(), journal.clone());
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        let mut sub = handle.connect("bob", 0).await.unwrap();
        assert!(matches!(sub.recv().await, Some(Outbound::Error(_))));

        journal.set_available(true);
        let event = journal.append("later", "alice").await.unwrap();
        handle.publish(event.clone()).await.unwrap();
        assert_eq!(sub.recv().await, Some(Outbound::Event(event)));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_session_is_evicted() {
        let config = HubConfig {
            session_buffer: 2,
            ..Default::default()
        };
        let hub = Hub::new(config);
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        let _slow = handle.connect("slow", 0).await.unwrap();
        let mut fast = handle.connect("fast", 0).await.unwrap();

        for i in 1..=3 {
            handle.publish(Event::new(i, "x", "alice")).await.unwrap();
            fast.recv().await.unwrap();
        }

        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.sessions_evicted, 1);
        assert_eq!(metrics.active_sessions, 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let hub = Hub::new(HubConfig::default());
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        let mut sub = handle.connect("alice", 0).await.unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(sub.recv().await, None);
        assert_eq!(handle.connect("bob", 0).await.err(), Some(HubError::Closed));
    }
}

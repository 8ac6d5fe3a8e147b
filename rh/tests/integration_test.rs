//! Integration tests for relayhub
//!
//! These tests run the journal, hub, server and client together over real
//! TCP connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use assert_cmd::Command;
use async_trait::async_trait;
use predicates::prelude::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use relayhub::client::Tail;
use relayhub::hub::{Hub, HubConfig, HubHandle};
use relayhub::journal::{Journal, MemoryJournal, SqliteJournal, SqliteOptions};
use relayhub::protocol::ServerMessage;
use relayhub::server::{Server, ServerConfig};
use relayhub::source::{CdcSubscriber, DirectWriter, UpstreamError, UpstreamStream};
use relayhub::RelayClient;

struct Relay {
    addr: SocketAddr,
    hub: HubHandle,
    cancel: CancellationToken,
}

impl Relay {
    async fn start(journal: Option<Arc<dyn Journal>>) -> Self {
        let (hub, writer) = match journal {
            Some(journal) => {
                let hub = Hub::with_journal(HubConfig::default(), journal.clone());
                let writer = DirectWriter::new(journal, hub.handle());
                (hub, Some(writer))
            }
            None => (Hub::new(HubConfig::default()), None),
        };
        let handle = hub.handle();
        tokio::spawn(hub.run());

        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let mut server = Server::new(config, handle.clone());
        if let Some(writer) = writer {
            server = server.with_writer(writer);
        }
        let listener = server.bind().await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(listener, cancel.clone()));

        Self {
            addr,
            hub: handle,
            cancel,
        }
    }

    fn client(&self) -> RelayClient {
        RelayClient::new(self.addr.to_string())
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn next_within(tail: &mut Tail, wait: Duration) -> Option<ServerMessage> {
    tokio::time::timeout(wait, tail.next()).await.ok()?.ok()?
}

async fn next(tail: &mut Tail) -> ServerMessage {
    next_within(tail, Duration::from_secs(5))
        .await
        .expect("expected a message from the relay")
}

fn event(content: &str, offset: &str, producer_id: &str) -> ServerMessage {
    ServerMessage::Event {
        content: content.to_string(),
        offset: offset.to_string(),
        producer_id: producer_id.to_string(),
    }
}

// =============================================================================
// Direct-write relay
// =============================================================================

#[tokio::test]
async fn test_catch_up_then_live_broadcast() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let journal = SqliteJournal::open(temp.path().join("relay.db"), SqliteOptions::default()).unwrap();
    journal.append("hello", "alice").await.unwrap();

    let relay = Relay::start(Some(Arc::new(journal.clone()))).await;

    let mut alice = relay.client().tail("alice", 0).await.unwrap();
    assert_eq!(next(&mut alice).await, event("hello", "1", "alice"));

    let mut bob = relay.client().tail("bob", 1).await.unwrap();

    alice.submit("hi").await.unwrap();
    assert_eq!(next(&mut alice).await, event("hi", "2", "alice"));
    assert_eq!(next(&mut bob).await, event("hi", "2", "alice"));
}

#[tokio::test]
async fn test_resume_offset_skips_seen_events() {
    let journal = Arc::new(MemoryJournal::new());
    for i in 1..=5 {
        journal.append(&format!("m{}", i), "alice").await.unwrap();
    }
    let relay = Relay::start(Some(journal.clone())).await;

    let mut tail = relay.client().tail("bob", 3).await.unwrap();
    assert_eq!(next(&mut tail).await.offset(), Some(4));
    assert_eq!(next(&mut tail).await.offset(), Some(5));

    let offset = relay.client().send("carol", "m6").await.unwrap();
    assert_eq!(offset, 6);
    assert_eq!(next(&mut tail).await, event("m6", "6", "carol"));
    assert_eq!(next_within(&mut tail, Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_resume_past_journal_end_receives_new_messages() {
    let journal = Arc::new(MemoryJournal::new());
    journal.append("before restart", "alice").await.unwrap();
    let relay = Relay::start(Some(journal.clone())).await;

    // Cursor handed out by an earlier relay whose journal was larger
    let mut tail = relay.client().tail("bob", 40).await.unwrap();
    assert_eq!(next_within(&mut tail, Duration::from_millis(100)).await, None);

    let offset = relay.client().send("alice", "after restart").await.unwrap();
    assert_eq!(offset, 2);
    assert_eq!(next(&mut tail).await, event("after restart", "2", "alice"));
}

#[tokio::test]
async fn test_send_skips_history() {
    let journal = Arc::new(MemoryJournal::with_batch_size(2));
    for i in 1..=20 {
        journal.append(&format!("m{}", i), "alice").await.unwrap();
    }
    let relay = Relay::start(Some(journal.clone())).await;

    let offset = relay.client().send("alice", "m21").await.unwrap();
    assert_eq!(offset, 21);

    let metrics = relay.hub.metrics().await.unwrap();
    assert_eq!(metrics.catch_up_events, 0);
}

#[tokio::test]
async fn test_storage_failure_reaches_only_the_sender() {
    let journal = Arc::new(MemoryJournal::new());
    let relay = Relay::start(Some(journal.clone())).await;

    let mut alice = relay.client().tail("alice", 0).await.unwrap();
    let mut bob = relay.client().tail("bob", 0).await.unwrap();

    // Let both sessions finish their (empty) catch-up
    tokio::time::sleep(Duration::from_millis(50)).await;
    journal.set_available(false);

    alice.submit("lost").await.unwrap();
    assert!(matches!(next(&mut alice).await, ServerMessage::Error { .. }));
    assert_eq!(next_within(&mut bob, Duration::from_millis(200)).await, None);

    let metrics = relay.hub.metrics().await.unwrap();
    assert_eq!(metrics.events_published, 0);
}

#[tokio::test]
async fn test_concurrent_producers_reach_every_session_once() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 10;
    const SESSIONS: usize = 3;

    let journal = Arc::new(MemoryJournal::new());
    let relay = Relay::start(Some(journal.clone())).await;

    let mut tails = Vec::new();
    for i in 0..SESSIONS {
        tails.push(relay.client().tail(&format!("viewer-{}", i), 0).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let writer = DirectWriter::new(journal.clone(), relay.hub.clone());
    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let writer = writer.clone();
        producers.push(tokio::spawn(async move {
            for n in 0..PER_PRODUCER {
                writer.submit(&format!("{}-{}", p, n), &format!("producer-{}", p)).await.unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let expected: Vec<u64> = (1..=(PRODUCERS * PER_PRODUCER) as u64).collect();
    for tail in tails.iter_mut() {
        let mut offsets = Vec::new();
        while offsets.len() < expected.len() {
            offsets.push(next(tail).await.offset().unwrap());
        }
        // Producers race each other, so arrival order may differ from offset order
        offsets.sort_unstable();
        assert_eq!(offsets, expected);
        assert_eq!(next_within(tail, Duration::from_millis(100)).await, None);
    }
}

#[tokio::test]
async fn test_disconnected_session_is_removed() {
    let journal = Arc::new(MemoryJournal::new());
    let relay = Relay::start(Some(journal)).await;

    let tail = relay.client().tail("alice", 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.hub.sessions().await.unwrap().len(), 1);

    drop(tail);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.hub.sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_health_check() {
    let relay = Relay::start(None).await;
    assert_eq!(relay.client().health().await.unwrap(), "ok");
}

// =============================================================================
// Subscribe relay
// =============================================================================

/// Replays fixed records, then stays open
struct ScriptedStream {
    records: Vec<Vec<u8>>,
}

#[async_trait]
impl UpstreamStream for ScriptedStream {
    async fn connect(&mut self) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn next_record(&mut self) -> Result<Option<Vec<u8>>, UpstreamError> {
        if self.records.is_empty() {
            std::future::pending::<()>().await;
        }
        Ok(Some(self.records.remove(0)))
    }

    async fn disconnect(&mut self) {}
}

#[tokio::test]
async fn test_change_feed_drops_malformed_records() {
    let relay = Relay::start(None).await;
    let mut tail = relay.client().tail("viewer", 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = ScriptedStream {
        records: vec![
            br#"{"payload":{"op":"c","after":{"id":1}}}"#.to_vec(),
            b"garbage".to_vec(),
            br#"{"payload":null}"#.to_vec(),
            br#"{"payload":{"op":"d","before":{"id":1}}}"#.to_vec(),
        ],
    };
    let cancel = CancellationToken::new();
    let subscriber = tokio::spawn(
        CdcSubscriber::new(stream, relay.hub.clone(), Duration::from_millis(10)).run(cancel.clone()),
    );

    let first = next(&mut tail).await;
    let second = next(&mut tail).await;
    assert!(matches!(first, ServerMessage::Change { ref payload } if payload["op"] == "c"));
    assert!(matches!(second, ServerMessage::Change { ref payload } if payload["op"] == "d"));

    cancel.cancel();
    let stats = subscriber.await.unwrap();
    assert_eq!(stats.published, 2);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.dropped, 1);
}

#[tokio::test]
async fn test_read_only_feed_rejects_messages() {
    let relay = Relay::start(None).await;
    let mut tail = relay.client().tail("viewer", 0).await.unwrap();

    tail.submit("hello").await.unwrap();
    assert_eq!(
        next(&mut tail).await,
        ServerMessage::Error {
            message: "This feed is read-only".to_string()
        }
    );
}

// =============================================================================
// Binary
// =============================================================================

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("relayhub")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("tail"));
}

#[test]
fn test_ping_without_relay_fails() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let temp = TempDir::new().unwrap();
    let config = temp.path().join("relayhub.yml");
    std::fs::write(&config, "log-level: error\n").unwrap();

    Command::cargo_bin("relayhub")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "ping", "--addr", &addr.to_string()])
        .assert()
        .failure();
}

#[test]
fn test_config_source_is_logged() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let temp = TempDir::new().unwrap();
    let config = temp.path().join("relayhub.yml");
    std::fs::write(&config, "log-level: info\n").unwrap();

    Command::cargo_bin("relayhub")
        .unwrap()
        .env_remove("RUST_LOG")
        .args(["--config", config.to_str().unwrap(), "ping", "--addr", &addr.to_string()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Loaded config from"));
}

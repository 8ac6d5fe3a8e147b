//! Client for talking to a running relay
//!
//! Used by the `ping`, `send` and `tail` subcommands and by tests.

use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::domain::{Offset, SessionId};
use crate::protocol::{ClientMessage, ServerMessage};

/// Default timeout for connecting and for awaiting replies
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Resume cursor past any stored offset: no catch-up, live events only
pub const LIVE_ONLY: Offset = i64::MAX as Offset;

/// Client for a relay server
#[derive(Debug, Clone)]
pub struct RelayClient {
    addr: String,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set a custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Check that the relay is alive; returns its status string
    pub async fn health(&self) -> Result<String> {
        debug!(addr = %self.addr, "RelayClient::health: called");
        let mut conn = self.open().await?;
        conn.send(&ClientMessage::Health).await?;
        match conn.recv_within(self.timeout).await? {
            Some(ServerMessage::Health { status }) => Ok(status),
            Some(ServerMessage::Error { message }) => Err(eyre::eyre!("Relay error: {}", message)),
            Some(other) => Err(eyre::eyre!("Unexpected response: {:?}", other)),
            None => Err(eyre::eyre!("Relay closed the connection")),
        }
    }

    /// Submit a message as `producer_id` and wait for it to be broadcast back
    ///
    /// Returns the offset the relay assigned.
    pub async fn send(&self, producer_id: &str, content: &str) -> Result<Offset> {
        debug!(addr = %self.addr, %producer_id, "RelayClient::send: called");
        let content = content.trim();
        if content.is_empty() {
            return Err(eyre::eyre!("Message content is empty"));
        }

        let mut conn = self.session(producer_id, LIVE_ONLY).await?.inner;
        conn.send(&ClientMessage::Message {
            content: content.to_string(),
        })
        .await?;

        loop {
            let msg = conn
                .recv_within(self.timeout)
                .await?
                .ok_or_else(|| eyre::eyre!("Relay closed the connection before confirming"))?;
            match msg {
                ServerMessage::Error { message } => return Err(eyre::eyre!("Relay error: {}", message)),
                ServerMessage::Event {
                    content: ref got,
                    producer_id: ref from,
                    ..
                } if got == content && from == producer_id => {
                    return msg.offset().ok_or_else(|| eyre::eyre!("Relay sent an invalid offset"));
                }
                other => debug!(?other, "Skipping unrelated message"),
            }
        }
    }

    /// Open a session that receives events after `from`
    pub async fn tail(&self, producer_id: &str, from: Offset) -> Result<Tail> {
        debug!(addr = %self.addr, %producer_id, from, "RelayClient::tail: called");
        let conn = self.session(producer_id, from).await?;
        Ok(Tail {
            session_id: conn.session_id,
            conn: conn.inner,
        })
    }

    async fn open(&self) -> Result<Connection> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .context("Connection timeout")?
            .with_context(|| format!("Failed to connect to {}", self.addr))?;
        let (read, write) = stream.into_split();
        Ok(Connection {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    async fn session(&self, producer_id: &str, resume_offset: Offset) -> Result<Session> {
        let mut conn = self.open().await?;
        conn.send(&ClientMessage::Connect {
            producer_id: producer_id.to_string(),
            resume_offset,
        })
        .await?;

        match conn.recv_within(self.timeout).await? {
            Some(ServerMessage::Welcome { session_id }) => {
                debug!(%session_id, "Session established");
                Ok(Session {
                    session_id,
                    inner: conn,
                })
            }
            Some(ServerMessage::Error { message }) => Err(eyre::eyre!("Relay error: {}", message)),
            Some(other) => Err(eyre::eyre!("Unexpected response: {:?}", other)),
            None => Err(eyre::eyre!("Relay closed the connection")),
        }
    }
}

struct Session {
    session_id: SessionId,
    inner: Connection,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(msg).context("Failed to serialize message")?;
        self.writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write message")?;
        self.writer.write_all(b"\n").await.context("Failed to write newline")?;
        self.writer.flush().await.context("Failed to flush stream")?;
        Ok(())
    }

    /// Next message; `None` when the relay closed the connection
    async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.context("Failed to read response")?;
        if read == 0 {
            return Ok(None);
        }
        let msg = serde_json::from_str(line.trim()).context("Failed to parse relay message")?;
        Ok(Some(msg))
    }

    async fn recv_within(&mut self, timeout: Duration) -> Result<Option<ServerMessage>> {
        tokio::time::timeout(timeout, self.recv()).await.context("Read timeout")?
    }
}

/// A live feed from the relay
pub struct Tail {
    session_id: SessionId,
    conn: Connection,
}

impl Tail {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Next message; `None` once the relay closes the feed
    pub async fn next(&mut self) -> Result<Option<ServerMessage>> {
        self.conn.recv().await
    }

    /// Submit a message on this session
    pub async fn submit(&mut self, content: &str) -> Result<()> {
        self.conn
            .send(&ClientMessage::Message {
                content: content.to_string(),
            })
            .await
    }
}

//! Per-connection session task

use std::io;
use std::net::SocketAddr;

use eyre::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::SessionId;
use crate::hub::HubHandle;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::source::{DirectWriter, SourceError};

/// Inbound frames buffered between the socket reader and the session loop
const INBOUND_BUFFER: usize = 16;

/// One inbound line, or why there isn't one
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Line(String),
    TooLong(usize),
    NotUtf8,
    Eof,
}

/// Read one newline-terminated line of at most `max` bytes
///
/// An oversized line is consumed up to its newline and reported as
/// `TooLong`, leaving the reader positioned at the next line. Bytes that are
/// not UTF-8 are reported as `NotUtf8` rather than repaired.
pub(crate) async fn read_frame<R>(reader: &mut R, max: usize) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let limit = max as u64 + 1;
    let mut buf = Vec::new();
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(Frame::Eof);
    }

    if buf.last() != Some(&b'\n') && buf.len() > max {
        let mut skipped = buf.len();
        loop {
            buf.clear();
            let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
            skipped += n;
            if n == 0 || buf.last() == Some(&b'\n') {
                break;
            }
        }
        return Ok(Frame::TooLong(skipped));
    }

    match String::from_utf8(buf) {
        Ok(line) => Ok(Frame::Line(line)),
        Err(_) => Ok(Frame::NotUtf8),
    }
}

/// Write one message as a JSON line
pub(crate) async fn write_message(writer: &mut OwnedWriteHalf, msg: &ServerMessage) -> Result<()> {
    let json = serde_json::to_string(msg).context("Failed to serialize message")?;
    writer.write_all(json.as_bytes()).await.context("Failed to write message")?;
    writer.write_all(b"\n").await.context("Failed to write newline")?;
    writer.flush().await.context("Failed to flush message")?;
    Ok(())
}

/// Shared pieces every connection task needs
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub hub: HubHandle,
    /// `None` serves a read-only feed
    pub writer: Option<DirectWriter>,
    pub max_line_bytes: usize,
}

/// Drive one client connection from handshake to disconnect
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ConnectionContext,
    cancel: CancellationToken,
) -> Result<()> {
    debug!(%peer, "handle_connection: called");

    let (read_half, mut write_half) = stream.into_split();
    let (frame_tx, mut frames) = mpsc::channel(INBOUND_BUFFER);
    let max_line_bytes = ctx.max_line_bytes;

    let reader_task = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            let frame = read_frame(&mut reader, max_line_bytes).await;
            let done = !matches!(frame, Ok(Frame::Line(_)) | Ok(Frame::TooLong(_)) | Ok(Frame::NotUtf8));
            if frame_tx.send(frame).await.is_err() || done {
                break;
            }
        }
    });

    let result = serve(&mut write_half, &mut frames, peer, &ctx, &cancel).await;
    reader_task.abort();
    result
}

async fn serve(
    write_half: &mut OwnedWriteHalf,
    frames: &mut mpsc::Receiver<io::Result<Frame>>,
    peer: SocketAddr,
    ctx: &ConnectionContext,
    cancel: &CancellationToken,
) -> Result<()> {
    let first = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        frame = frames.recv() => frame,
    };

    let (producer_id, resume_offset) = match first {
        Some(Ok(Frame::Line(line))) => match serde_json::from_str::<ClientMessage>(line.trim()) {
            Ok(ClientMessage::Connect {
                producer_id,
                resume_offset,
            }) => (producer_id, resume_offset),
            Ok(ClientMessage::Health) => {
                debug!(%peer, "Health check");
                return write_message(write_half, &ServerMessage::health_ok()).await;
            }
            Ok(_) => {
                return write_message(write_half, &ServerMessage::error("Expected Connect")).await;
            }
            Err(e) => {
                debug!(%peer, error = %e, "Unparseable handshake");
                return write_message(write_half, &ServerMessage::error("Invalid message")).await;
            }
        },
        Some(Ok(Frame::TooLong(_))) => {
            return write_message(write_half, &ServerMessage::error("Message too large")).await;
        }
        Some(Ok(Frame::NotUtf8)) => {
            return write_message(write_half, &ServerMessage::error("Invalid message")).await;
        }
        _ => return Ok(()),
    };

    let mut subscription = ctx
        .hub
        .connect(&producer_id, resume_offset)
        .await
        .context("Hub unavailable")?;
    let session_id = subscription.id();
    info!(%peer, %session_id, %producer_id, resume_offset, "Session connected");

    let welcome = write_message(write_half, &ServerMessage::Welcome { session_id }).await;
    if welcome.is_ok() {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%session_id, "Shutdown requested");
                    break;
                }
                outbound = subscription.recv() => {
                    let Some(outbound) = outbound else {
                        debug!(%session_id, "Hub dropped session");
                        break;
                    };
                    let mut failed = false;
                    for msg in ServerMessage::from_outbound(outbound) {
                        if let Err(e) = write_message(write_half, &msg).await {
                            debug!(%session_id, error = %e, "Write failed");
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        break;
                    }
                }
                frame = frames.recv() => {
                    match frame {
                        Some(Ok(Frame::Line(line))) => {
                            if !handle_line(&line, session_id, &producer_id, write_half, ctx).await {
                                break;
                            }
                        }
                        Some(Ok(Frame::TooLong(len))) => {
                            debug!(%session_id, len, "Inbound line too large");
                            let _ = ctx.hub.error(session_id, "Message too large").await;
                        }
                        Some(Ok(Frame::NotUtf8)) => {
                            debug!(%session_id, "Inbound line is not UTF-8");
                            let _ = ctx.hub.error(session_id, "Invalid message").await;
                        }
                        Some(Ok(Frame::Eof)) | None => {
                            debug!(%session_id, "Client closed connection");
                            break;
                        }
                        Some(Err(e)) => {
                            debug!(%session_id, error = %e, "Read failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    let _ = ctx.hub.disconnect(session_id).await;
    info!(%session_id, "Session disconnected");
    Ok(())
}

/// Handle one inbound line on an established session; false ends it
async fn handle_line(
    line: &str,
    session_id: SessionId,
    producer_id: &str,
    write_half: &mut OwnedWriteHalf,
    ctx: &ConnectionContext,
) -> bool {
    let msg = match serde_json::from_str::<ClientMessage>(line.trim()) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(%session_id, error = %e, "Unparseable line");
            let _ = ctx.hub.error(session_id, "Invalid message").await;
            return true;
        }
    };

    match msg {
        ClientMessage::Message { content } => {
            let Some(ref writer) = ctx.writer else {
                let _ = ctx.hub.error(session_id, "This feed is read-only").await;
                return true;
            };
            match writer.submit(&content, producer_id).await {
                Ok(event) => debug!(%session_id, offset = event.offset, "Message accepted"),
                Err(SourceError::EmptyContent) => {
                    let _ = ctx.hub.error(session_id, SourceError::EmptyContent.to_string()).await;
                }
                Err(e) => {
                    warn!(%session_id, error = %e, "Failed to persist message");
                    let _ = ctx.hub.error(session_id, "Failed to send message").await;
                }
            }
            true
        }
        ClientMessage::Health => write_message(write_half, &ServerMessage::health_ok()).await.is_ok(),
        ClientMessage::Connect { .. } => {
            let _ = ctx.hub.error(session_id, "Already connected").await;
            true
        }
    }
}

//! TCP relay server
//!
//! Accepts newline-delimited JSON connections (see [`crate::protocol`]) and
//! runs one session task per connection. Every session is registered with the
//! hub; with a [`DirectWriter`] attached, sessions may also submit messages.

mod config;
mod connection;

use eyre::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::HubHandle;
use crate::source::DirectWriter;
use connection::{ConnectionContext, handle_connection};

pub use config::ServerConfig;

/// The relay's network front end
pub struct Server {
    config: ServerConfig,
    hub: HubHandle,
    writer: Option<DirectWriter>,
}

impl Server {
    /// Create a read-only server (sessions only receive)
    pub fn new(config: ServerConfig, hub: HubHandle) -> Self {
        Self {
            config,
            hub,
            writer: None,
        }
    }

    /// Allow sessions to submit messages through `writer`
    pub fn with_writer(mut self, writer: DirectWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        debug!(bind = %self.config.bind, "Server::bind: called");
        let listener = TcpListener::bind(&self.config.bind)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind))?;
        Ok(listener)
    }

    /// Accept connections until `cancel` fires, then wait for sessions
    ///
    /// Sessions still running after `shutdown-timeout-secs` are aborted.
    pub async fn run(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let addr = listener.local_addr().context("Failed to read listener address")?;
        info!(%addr, read_only = self.writer.is_none(), "Server listening");

        let ctx = ConnectionContext {
            hub: self.hub.clone(),
            writer: self.writer.clone(),
            max_line_bytes: self.config.max_line_bytes,
        };
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted connection");
                        let ctx = ctx.clone();
                        let cancel = cancel.clone();
                        sessions.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, ctx, cancel).await {
                                warn!(%peer, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Session task failed");
                    }
                }
            }
        }

        drop(listener);
        info!(active = sessions.len(), "Server stopping");

        let drained = tokio::time::timeout(self.config.shutdown_timeout(), async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(remaining = sessions.len(), "Shutdown timeout, aborting sessions");
            sessions.shutdown().await;
        }

        info!("Server stopped");
        Ok(())
    }
}

//! SQLite journal - actor that owns the connection
//!
//! A dedicated thread owns the `rusqlite::Connection` and processes commands
//! in arrival order. [`SqliteJournal`] is the cloneable handle that sends
//! commands and awaits replies, so appends and reads never interleave
//! mid-statement and an append is committed before its reply is sent.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, params};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{DEFAULT_BATCH_SIZE, Journal, JournalError};
use crate::domain::{Event, Offset};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    user TEXT NOT NULL,
    created_at INTEGER NOT NULL
)";

/// Options for opening a SQLite journal
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Maximum events per `read_since`
    pub batch_size: usize,
    /// Create the `messages` table if it does not exist
    pub create_schema: bool,
    /// How long to wait on a locked database
    pub busy_timeout: Duration,
    /// Command channel buffer
    pub channel_buffer: usize,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            create_schema: true,
            busy_timeout: Duration::from_secs(5),
            channel_buffer: 256,
        }
    }
}

/// Commands sent to the journal actor
#[derive(Debug)]
enum JournalCommand {
    Append {
        content: String,
        producer_id: String,
        reply: oneshot::Sender<Result<Event, JournalError>>,
    },
    ReadSince {
        after: Offset,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<Event>, JournalError>>,
    },
    Check {
        reply: oneshot::Sender<Result<(), JournalError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the SQLite journal actor
#[derive(Clone)]
pub struct SqliteJournal {
    tx: mpsc::Sender<JournalCommand>,
    batch_size: usize,
}

impl SqliteJournal {
    /// Open (or create) the journal database at `path`
    pub fn open(path: impl AsRef<Path>, options: SqliteOptions) -> Result<Self, JournalError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "SqliteJournal::open: called");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| JournalError::StorageUnavailable(format!("create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(%mode, "SqliteJournal::open: journal mode set");
        Self::start(conn, options)
    }

    /// Open a private in-memory database
    pub fn open_in_memory(options: SqliteOptions) -> Result<Self, JournalError> {
        debug!("SqliteJournal::open_in_memory: called");
        Self::start(Connection::open_in_memory()?, options)
    }

    fn start(conn: Connection, options: SqliteOptions) -> Result<Self, JournalError> {
        conn.busy_timeout(options.busy_timeout)?;
        if options.create_schema {
            conn.execute(SCHEMA, [])?;
        }

        let (tx, rx) = mpsc::channel(options.channel_buffer.max(1));
        std::thread::Builder::new()
            .name("relayhub-journal".to_string())
            .spawn(move || actor_loop(conn, rx))
            .map_err(|e| JournalError::StorageUnavailable(format!("spawn journal thread: {}", e)))?;

        info!(batch_size = options.batch_size, "SqliteJournal started");
        Ok(Self {
            tx,
            batch_size: options.batch_size.max(1),
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, JournalError>>) -> JournalCommand,
    ) -> Result<T, JournalError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.map_err(|_| closed())?;
        reply_rx.await.map_err(|_| closed())?
    }
}

fn closed() -> JournalError {
    JournalError::StorageUnavailable("journal closed".to_string())
}

#[async_trait]
impl Journal for SqliteJournal {
    async fn append(&self, content: &str, producer_id: &str) -> Result<Event, JournalError> {
        debug!(%producer_id, "SqliteJournal::append: called");
        self.request(|reply| JournalCommand::Append {
            content: content.to_string(),
            producer_id: producer_id.to_string(),
            reply,
        })
        .await
    }

    async fn read_since(&self, after: Offset) -> Result<Vec<Event>, JournalError> {
        debug!(after, "SqliteJournal::read_since: called");
        let limit = self.batch_size;
        self.request(|reply| JournalCommand::ReadSince { after, limit, reply })
            .await
    }

    async fn check(&self) -> Result<(), JournalError> {
        debug!("SqliteJournal::check: called");
        self.request(|reply| JournalCommand::Check { reply }).await
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn close(&self) {
        debug!("SqliteJournal::close: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(JournalCommand::Close { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

/// The actor loop that owns the connection and processes commands
fn actor_loop(conn: Connection, mut rx: mpsc::Receiver<JournalCommand>) {
    debug!("journal actor started");

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            JournalCommand::Append {
                content,
                producer_id,
                reply,
            } => {
                let result = append(&conn, &content, &producer_id);
                if let Err(ref e) = result {
                    warn!(error = %e, %producer_id, "journal append failed");
                }
                let _ = reply.send(result);
            }

            JournalCommand::ReadSince { after, limit, reply } => {
                let _ = reply.send(read_since(&conn, after, limit));
            }

            JournalCommand::Check { reply } => {
                let result = conn
                    .prepare("SELECT 1 FROM messages LIMIT 1")
                    .and_then(|mut stmt| stmt.exists([]))
                    .map(|_| ())
                    .map_err(JournalError::from);
                let _ = reply.send(result);
            }

            JournalCommand::Close { reply } => {
                debug!("journal actor closing");
                rx.close();
                // Reject anything queued behind the close
                while let Ok(cmd) = rx.try_recv() {
                    reject(cmd);
                }
                if let Err((_, e)) = conn.close() {
                    warn!(error = %e, "journal connection close failed");
                }
                let _ = reply.send(());
                info!("SqliteJournal closed");
                return;
            }
        }
    }

    debug!("journal actor stopped: all handles dropped");
}

fn reject(cmd: JournalCommand) {
    match cmd {
        JournalCommand::Append { reply, .. } => {
            let _ = reply.send(Err(closed()));
        }
        JournalCommand::ReadSince { reply, .. } => {
            let _ = reply.send(Err(closed()));
        }
        JournalCommand::Check { reply } => {
            let _ = reply.send(Err(closed()));
        }
        JournalCommand::Close { reply } => {
            let _ = reply.send(());
        }
    }
}

fn append(conn: &Connection, content: &str, producer_id: &str) -> Result<Event, JournalError> {
    let created_at = chrono::Utc::now().timestamp_millis();
    conn.execute(
        "INSERT INTO messages (content, user, created_at) VALUES (?1, ?2, ?3)",
        params![content, producer_id, created_at],
    )?;
    let offset = conn.last_insert_rowid() as Offset;
    debug!(offset, "journal append committed");
    Ok(Event::new(offset, content, producer_id))
}

fn read_since(conn: &Connection, after: Offset, limit: usize) -> Result<Vec<Event>, JournalError> {
    // Row ids are signed; nothing can exist past i64::MAX
    let Ok(after) = i64::try_from(after) else {
        return Ok(Vec::new());
    };
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);

    let mut stmt = conn.prepare_cached("SELECT id, content, user FROM messages WHERE id > ?1 ORDER BY id ASC LIMIT ?2")?;
    let rows = stmt.query_map(params![after, limit], |row| {
        Ok(Event {
            offset: row.get::<_, i64>(0)? as Offset,
            content: row.get(1)?,
            producer_id: row.get(2)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(JournalError::from)
}

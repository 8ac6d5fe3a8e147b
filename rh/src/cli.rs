//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// relayhub - real-time message relay with durable catch-up
#[derive(Parser)]
#[command(
    name = "relayhub",
    about = "Real-time message relay with durable catch-up",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the chat relay: messages are journaled, then broadcast
    Serve {
        /// Address to listen on (overrides server.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run the read-only CDC relay (requires the `kafka` feature)
    Follow {
        /// Address to listen on (overrides server.bind)
        #[arg(short, long)]
        bind: Option<String>,

        /// Upstream topic (overrides upstream.topic)
        #[arg(short, long)]
        topic: Option<String>,
    },

    /// Check that a relay is alive
    Ping {
        /// Relay address (defaults to server.bind)
        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Send one message
    Send {
        /// Producer id to send as
        producer: String,

        /// Message content
        message: String,

        /// Relay address (defaults to server.bind)
        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Print events as they arrive, starting after an offset
    Tail {
        /// Producer id to connect as
        producer: String,

        /// Resume after this offset (0 replays everything)
        #[arg(short, long, default_value_t = 0)]
        from: u64,

        /// Relay address (defaults to server.bind)
        #[arg(short, long)]
        addr: Option<String>,
    },
}

//! relayhub - real-time message relay with durable catch-up
//!
//! CLI entry point for running relays and talking to them.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::Colorize;
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relayhub::cli::{Cli, Command};
use relayhub::config::{Config, JournalBackend};
use relayhub::hub::Hub;
use relayhub::journal::{Journal, MemoryJournal, SqliteJournal};
use relayhub::protocol::ServerMessage;
use relayhub::server::Server;
use relayhub::source::DirectWriter;
use relayhub::RelayClient;

fn parse_level(s: &str) -> tracing::Level {
    match s.to_uppercase().as_str() {
        "TRACE" => tracing::Level::TRACE,
        "DEBUG" => tracing::Level::DEBUG,
        "INFO" => tracing::Level::INFO,
        "WARN" | "WARNING" => tracing::Level::WARN,
        "ERROR" => tracing::Level::ERROR,
        _ => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
            tracing::Level::INFO
        }
    }
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>, log_file: Option<&Path>) -> Result<()> {
    // Priority: CLI --log-level > config file > default (INFO)
    let level = cli_log_level
        .or(config_log_level)
        .map(parse_level)
        .unwrap_or(tracing::Level::INFO);
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).context("Failed to create log directory")?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context("Failed to open log file")?;
            tracing_subscriber::fmt()
                .with_writer(file)
                .with_ansi(false)
                .with_env_filter(filter)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
    }

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log settings early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    let loaded = Config::load_reporting(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(
        cli.log_level.as_deref(),
        config_log_level.as_deref(),
        loaded.config.log_file.as_deref(),
    )
    .context("Failed to setup logging")?;
    loaded.log();
    let config = loaded.config;

    config.validate().context("Invalid configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        Some(Command::Follow { bind, topic }) => cmd_follow(config, bind, topic).await,
        Some(Command::Ping { addr }) => cmd_ping(&config, addr).await,
        Some(Command::Send { producer, message, addr }) => cmd_send(&config, addr, &producer, &message).await,
        Some(Command::Tail { producer, from, addr }) => cmd_tail(&config, addr, &producer, from).await,
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Open the configured journal and make sure it is reachable
async fn open_journal(config: &Config) -> Result<Arc<dyn Journal>> {
    let journal: Arc<dyn Journal> = match config.journal.backend {
        JournalBackend::Sqlite => {
            info!(path = %config.journal.path.display(), "Opening SQLite journal");
            let journal = SqliteJournal::open(&config.journal.path, config.journal.sqlite_options())
                .with_context(|| format!("Failed to open journal at {}", config.journal.path.display()))?;
            Arc::new(journal)
        }
        JournalBackend::Memory => {
            warn!("Using in-memory journal; history is lost on exit");
            Arc::new(MemoryJournal::with_batch_size(config.journal.batch_size))
        }
    };

    journal.check().await.context("Journal check failed")?;
    Ok(journal)
}

/// Run the chat relay until SIGINT/SIGTERM
async fn cmd_serve(mut config: Config, bind: Option<String>) -> Result<()> {
    debug!(?bind, "cmd_serve: called");
    if let Some(bind) = bind {
        config.server.bind = bind;
    }

    let journal = open_journal(&config).await?;

    let hub = Hub::with_journal(config.hub.clone(), journal.clone());
    let hub_handle = hub.handle();
    let hub_task = tokio::spawn(hub.run());

    let writer = DirectWriter::new(journal.clone(), hub_handle.clone());
    let server = Server::new(config.server.clone(), hub_handle.clone()).with_writer(writer);
    let listener = server.bind().await?;

    let cancel = CancellationToken::new();
    let server_task = tokio::spawn(server.run(listener, cancel.clone()));

    info!("Relay running. Press Ctrl+C to stop.");
    wait_for_shutdown().await?;
    cancel.cancel();

    match server_task.await {
        Ok(Err(e)) => warn!(error = %e, "Server error"),
        Err(e) => warn!(error = %e, "Server task failed"),
        Ok(Ok(())) => {}
    }

    let _ = hub_handle.shutdown().await;
    let _ = hub_task.await;
    journal.close().await;

    info!("Relay stopped");
    Ok(())
}

/// Run the read-only CDC relay until SIGINT/SIGTERM
#[cfg(feature = "kafka")]
async fn cmd_follow(mut config: Config, bind: Option<String>, topic: Option<String>) -> Result<()> {
    use relayhub::source::{CdcSubscriber, KafkaStream};

    debug!(?bind, ?topic, "cmd_follow: called");
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(topic) = topic {
        config.upstream.topic = topic;
    }
    config.validate().context("Invalid configuration")?;

    let hub = Hub::new(config.hub.clone());
    let hub_handle = hub.handle();
    let hub_task = tokio::spawn(hub.run());

    let server = Server::new(config.server.clone(), hub_handle.clone());
    let listener = server.bind().await?;

    let cancel = CancellationToken::new();
    let server_task = tokio::spawn(server.run(listener, cancel.clone()));

    let retry_delay = std::time::Duration::from_secs(config.upstream.retry_delay_secs);
    let subscriber = CdcSubscriber::new(KafkaStream::new(config.upstream.clone()), hub_handle.clone(), retry_delay);
    let subscriber_task = tokio::spawn(subscriber.run(cancel.child_token()));

    info!(topic = %config.upstream.topic, "Relay following upstream. Press Ctrl+C to stop.");
    wait_for_shutdown().await?;
    cancel.cancel();

    match server_task.await {
        Ok(Err(e)) => warn!(error = %e, "Server error"),
        Err(e) => warn!(error = %e, "Server task failed"),
        Ok(Ok(())) => {}
    }
    match subscriber_task.await {
        Ok(stats) => info!(?stats, "Subscriber finished"),
        Err(e) => warn!(error = %e, "Subscriber task failed"),
    }

    let _ = hub_handle.shutdown().await;
    let _ = hub_task.await;

    info!("Relay stopped");
    Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn cmd_follow(_config: Config, _bind: Option<String>, _topic: Option<String>) -> Result<()> {
    Err(eyre::eyre!(
        "relayhub was built without the `kafka` feature; rebuild with `--features kafka` to use follow"
    ))
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl+C")?;
        warn!("Ctrl+C received");
    }

    Ok(())
}

fn client_for(config: &Config, addr: Option<String>) -> RelayClient {
    RelayClient::new(addr.unwrap_or_else(|| config.server.bind.clone()))
}

async fn cmd_ping(config: &Config, addr: Option<String>) -> Result<()> {
    debug!(?addr, "cmd_ping: called");
    let client = client_for(config, addr);

    match client.health().await {
        Ok(status) => {
            println!("{} {} ({})", "✓".green(), client.addr(), status);
            Ok(())
        }
        Err(e) => {
            println!("{} {} is not responding", "✗".red(), client.addr());
            Err(e)
        }
    }
}

async fn cmd_send(config: &Config, addr: Option<String>, producer: &str, message: &str) -> Result<()> {
    debug!(?addr, %producer, "cmd_send: called");
    let client = client_for(config, addr);

    let offset = client.send(producer, message).await.context("Failed to send message")?;
    println!("{} sent at offset {}", "✓".green(), offset.to_string().bold());
    Ok(())
}

async fn cmd_tail(config: &Config, addr: Option<String>, producer: &str, from: u64) -> Result<()> {
    debug!(?addr, %producer, from, "cmd_tail: called");
    let client = client_for(config, addr);

    let mut tail = client.tail(producer, from).await?;
    eprintln!("{} session {}", "connected".dimmed(), tail.session_id());

    loop {
        let msg = tokio::select! {
            msg = tail.next() => msg?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(msg) = msg else {
            eprintln!("{}", "relay closed the connection".dimmed());
            break;
        };
        print_message(&msg);
    }

    Ok(())
}

fn print_message(msg: &ServerMessage) {
    match msg {
        ServerMessage::Event {
            content,
            offset,
            producer_id,
        } => println!("{} {}: {}", format!("[{}]", offset).dimmed(), producer_id.cyan().bold(), content),
        ServerMessage::Change { payload } => println!("{} {}", "change".yellow(), payload),
        ServerMessage::Error { message } => eprintln!("{} {}", "error:".red().bold(), message),
        ServerMessage::Welcome { session_id } => debug!(%session_id, "Unexpected welcome"),
        ServerMessage::Health { status } => println!("{} {}", "health".green(), status),
    }
}

//! relayhub configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::hub::HubConfig;
use crate::journal::{DEFAULT_BATCH_SIZE, SqliteOptions};
use crate::server::ServerConfig;
use crate::source::UpstreamConfig;

/// Main relayhub configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,

    /// Durable log storage
    pub journal: JournalConfig,

    /// Fan-out buffers
    pub hub: HubConfig,

    /// CDC feed for `follow`
    pub upstream: UpstreamConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Write logs here instead of stderr
    #[serde(rename = "log-file")]
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            return Err(eyre::eyre!("server.bind must not be empty"));
        }
        if self.server.max_line_bytes == 0 {
            return Err(eyre::eyre!("server.max-line-bytes must be greater than zero"));
        }
        if self.journal.batch_size == 0 {
            return Err(eyre::eyre!("journal.batch-size must be greater than zero"));
        }
        if self.hub.channel_buffer == 0 || self.hub.session_buffer == 0 {
            return Err(eyre::eyre!("hub buffers must be greater than zero"));
        }
        if self.upstream.topic.trim().is_empty() {
            return Err(eyre::eyre!("upstream.topic must not be empty"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        Ok(Self::load_reporting(config_path)?.config)
    }

    /// Load configuration, keeping a record of where it came from
    ///
    /// Runs before logging is set up, so nothing is logged here; call
    /// [`ConfigLoad::log`] once the subscriber is installed.
    pub fn load_reporting(config_path: Option<&PathBuf>) -> Result<ConfigLoad> {
        if let Some(path) = config_path {
            let config = Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()))?;
            return Ok(ConfigLoad {
                config,
                source: Some(path.clone()),
                skipped: Vec::new(),
            });
        }

        let mut skipped = Vec::new();
        for candidate in Self::candidates() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => {
                        return Ok(ConfigLoad {
                            config,
                            source: Some(candidate),
                            skipped,
                        });
                    }
                    Err(e) => skipped.push((candidate, format!("{:#}", e))),
                }
            }
        }

        Ok(ConfigLoad {
            config: Self::default(),
            source: None,
            skipped,
        })
    }

    /// Read just `log-level` so logging can start before the full load
    ///
    /// Never fails; any problem yields `None`.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = match config_path {
            Some(path) => path.clone(),
            None => Self::candidates().into_iter().find(|p| p.exists())?,
        };
        let content = fs::read_to_string(path).ok()?;
        let value: serde_yaml::Value = serde_yaml::from_str(&content).ok()?;
        value.get("log-level")?.as_str().map(str::to_string)
    }

    /// Project-local `.relayhub.yml`, then `~/.config/relayhub/relayhub.yml`
    fn candidates() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".relayhub.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("relayhub").join("relayhub.yml"));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }
}

/// A loaded config plus what the fallback chain saw on the way
#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    /// File the config came from; `None` means defaults
    pub source: Option<PathBuf>,
    /// Candidates that exist but failed to load, with the reason
    pub skipped: Vec<(PathBuf, String)>,
}

impl ConfigLoad {
    /// Report the load outcome through tracing
    pub fn log(&self) {
        for (path, reason) in &self.skipped {
            tracing::warn!("Failed to load config from {}: {}", path.display(), reason);
        }
        match self.source {
            Some(ref path) => tracing::info!("Loaded config from: {}", path.display()),
            None => tracing::info!("No config file found, using defaults"),
        }
    }
}

/// Which journal implementation to run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Durable log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub backend: JournalBackend,

    /// SQLite database file
    pub path: PathBuf,

    /// Events per `read_since` page
    #[serde(rename = "batch-size")]
    pub batch_size: usize,

    /// Create the `messages` table if missing
    #[serde(rename = "create-schema")]
    pub create_schema: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        // XDG data directory (~/.local/share/relayhub on Linux)
        let path = dirs::data_dir()
            .map(|d| d.join("relayhub"))
            .unwrap_or_else(|| PathBuf::from(".relayhub"))
            .join("relayhub.db");

        Self {
            backend: JournalBackend::Sqlite,
            path,
            batch_size: DEFAULT_BATCH_SIZE,
            create_schema: true,
        }
    }
}

impl JournalConfig {
    pub fn sqlite_options(&self) -> SqliteOptions {
        SqliteOptions {
            batch_size: self.batch_size,
            create_schema: self.create_schema,
            ..Default::default()
        }
    }
}

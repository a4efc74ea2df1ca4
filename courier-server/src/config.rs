//! Configuration system for the Courier server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courier-server/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use courier_proto::group::Group;
use courier_proto::message::GroupId;

use crate::engine::EngineConfig;

/// Errors that can occur when loading server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerConfigFile {
    server: ServerFileConfig,
    engine: EngineFileConfig,
    store: StoreFileConfig,
}

/// `[server]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    log_file: Option<PathBuf>,
}

/// `[engine]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct EngineFileConfig {
    typing_timeout_ms: Option<u64>,
    dedup_ttl_secs: Option<u64>,
    dedup_bucket_secs: Option<u64>,
    max_content_len: Option<usize>,
    max_attachment_size: Option<usize>,
    history_limit: Option<usize>,
}

/// `[store]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StoreFileConfig {
    friends_only: Option<bool>,
    groups: Vec<GroupSeed>,
}

/// A group created at startup, from a `[[store.groups]]` table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct GroupSeed {
    /// Group id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Owner user id.
    pub owner: String,
    /// Additional members.
    #[serde(default)]
    pub members: Vec<String>,
}

impl GroupSeed {
    /// The group this seed describes.
    #[must_use]
    pub fn to_group(&self) -> Group {
        Group::new(GroupId::new(&self.id), &self.name, self.owner.as_str().into())
            .with_members(self.members.iter().map(|m| m.as_str().into()))
    }
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Courier real-time delivery server")]
pub struct ServerCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "COURIER_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/courier-server/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Typing indicator timeout in milliseconds.
    #[arg(long)]
    pub typing_timeout_ms: Option<u64>,

    /// Maximum number of messages returned per history fetch.
    #[arg(long)]
    pub history_limit: Option<usize>,

    /// Only allow direct messages between recorded friends.
    #[arg(long)]
    pub friends_only: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURIER_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stdout.
    #[arg(long, env = "COURIER_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9100`).
    pub bind_addr: String,
    /// Log level filter string.
    pub log_level: String,
    /// Optional log file; stdout when absent.
    pub log_file: Option<PathBuf>,
    /// Engine tunables.
    pub engine: EngineConfig,
    /// Whether direct messages require a friendship.
    pub friends_only: bool,
    /// Groups to create at startup.
    pub groups: Vec<GroupSeed>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9100".to_string(),
            log_level: "info".to_string(),
            log_file: None,
            engine: EngineConfig::default(),
            friends_only: false,
            groups: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &ServerCliArgs, file: &ServerConfigFile) -> Self {
        let defaults = Self::default();
        let engine_defaults = defaults.engine;
        let e = &file.engine;

        let engine = EngineConfig {
            typing_timeout: cli
                .typing_timeout_ms
                .or(e.typing_timeout_ms)
                .map_or(engine_defaults.typing_timeout, Duration::from_millis),
            dedup_ttl: e
                .dedup_ttl_secs
                .map_or(engine_defaults.dedup_ttl, Duration::from_secs),
            dedup_bucket: e
                .dedup_bucket_secs
                .map_or(engine_defaults.dedup_bucket, Duration::from_secs),
            max_content_len: e
                .max_content_len
                .unwrap_or(engine_defaults.max_content_len),
            max_attachment_size: e
                .max_attachment_size
                .unwrap_or(engine_defaults.max_attachment_size),
            history_limit: cli
                .history_limit
                .or(e.history_limit)
                .unwrap_or(engine_defaults.history_limit),
        };

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            log_level: cli.log_level.clone(),
            log_file: cli
                .log_file
                .clone()
                .or_else(|| file.server.log_file.clone()),
            engine,
            friends_only: cli.friends_only || file.store.friends_only.unwrap_or(false),
            groups: file.store.groups.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<ServerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ServerConfigFile::default());
        };
        config_dir.join("courier-server").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

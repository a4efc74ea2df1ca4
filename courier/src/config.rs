//! Configuration system for the `courier` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courier/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use courier_proto::codec::WireFormat;
use courier_proto::message::UserId;

use crate::connection::ConnectOptions;
use crate::net::Backoff;

/// Errors that can occur when loading configuration.
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

    /// No user id was configured anywhere.
    #[error("no user id configured (pass --user or set [network] user_id)")]
    MissingUserId,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    cache: CacheFileConfig,
    log: LogFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    server_url: Option<String>,
    user_id: Option<String>,
    connect_timeout_secs: Option<u64>,
    join_timeout_secs: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    json: Option<bool>,
}

/// `[cache]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CacheFileConfig {
    path: Option<PathBuf>,
    seen_ttl_secs: Option<u64>,
    typing_timeout_secs: Option<u64>,
}

/// `[log]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LogFileConfig {
    level: Option<String>,
    file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the client.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Courier line-mode chat client")]
pub struct CliArgs {
    /// WebSocket URL of the server (e.g., `ws://127.0.0.1:9100/ws`).
    #[arg(short, long, env = "COURIER_SERVER")]
    pub server: Option<String>,

    /// User id to join as.
    #[arg(short, long, env = "COURIER_USER")]
    pub user: Option<String>,

    /// Path to config file (default: `~/.config/courier/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Use JSON text frames instead of binary frames.
    #[arg(long)]
    pub json: bool,

    /// Path of the persisted unread cache.
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, env = "COURIER_LOG")]
    pub log_level: Option<String>,

    /// Log file (default: `courier.log` in the temp directory).
    #[arg(long, env = "COURIER_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Server WebSocket URL.
    pub server_url: String,
    /// Identity to join as.
    pub user_id: Option<String>,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Timeout for the `joined` acknowledgment.
    pub join_timeout: Duration,
    /// First reconnect delay.
    pub reconnect_initial: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max: Duration,
    /// Wire format for outbound frames.
    pub format: WireFormat,

    // -- Cache --
    /// Explicit unread cache path; derived from the user id when absent.
    pub cache_path: Option<PathBuf>,
    /// How long a processed message id is remembered.
    pub seen_ttl: Duration,
    /// Local expiry for remote typing indicators.
    pub typing_timeout: Duration,

    // -- Logging --
    /// Log level filter string.
    pub log_level: String,
    /// Log file; the temp directory is used when absent.
    pub log_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9100/ws".to_string(),
            user_id: None,
            connect_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(5),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            format: WireFormat::Binary,
            cache_path: None,
            seen_ttl: Duration::from_secs(300),
            typing_timeout: Duration::from_secs(6),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or if any config file cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let net = &file.network;

        let format = if cli.json || net.json.unwrap_or(false) {
            WireFormat::Json
        } else {
            defaults.format
        };

        Self {
            server_url: cli
                .server
                .clone()
                .or_else(|| net.server_url.clone())
                .unwrap_or(defaults.server_url),
            user_id: cli.user.clone().or_else(|| net.user_id.clone()),
            connect_timeout: net
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            join_timeout: net
                .join_timeout_secs
                .map_or(defaults.join_timeout, Duration::from_secs),
            reconnect_initial: net
                .reconnect_initial_ms
                .map_or(defaults.reconnect_initial, Duration::from_millis),
            reconnect_max: net
                .reconnect_max_ms
                .map_or(defaults.reconnect_max, Duration::from_millis),
            format,
            cache_path: cli.cache.clone().or_else(|| file.cache.path.clone()),
            seen_ttl: file
                .cache
                .seen_ttl_secs
                .map_or(defaults.seen_ttl, Duration::from_secs),
            typing_timeout: file
                .cache
                .typing_timeout_secs
                .map_or(defaults.typing_timeout, Duration::from_secs),
            log_level: cli
                .log_level
                .clone()
                .or_else(|| file.log.level.clone())
                .unwrap_or(defaults.log_level),
            log_file: cli.log_file.clone().or_else(|| file.log.file.clone()),
        }
    }

    /// The configured identity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingUserId`] if none was given.
    pub fn user(&self) -> Result<UserId, ConfigError> {
        self.user_id
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(UserId::new)
            .ok_or(ConfigError::MissingUserId)
    }

    /// Where the unread cache lives for `user`.
    ///
    /// Falls back to the temp directory when the platform has no cache dir.
    #[must_use]
    pub fn cache_path_for(&self, user: &UserId) -> PathBuf {
        if let Some(path) = &self.cache_path {
            return path.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("courier")
            .join(format!("unread-{user}.json"))
    }

    /// Connection settings for `user`.
    #[must_use]
    pub fn connect_options(&self, user: UserId) -> ConnectOptions {
        ConnectOptions {
            url: self.server_url.clone(),
            user_id: user,
            format: self.format,
            connect_timeout: self.connect_timeout,
            join_timeout: self.join_timeout,
        }
    }

    /// Reconnect schedule.
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        Backoff::new(self.reconnect_initial, self.reconnect_max)
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("courier").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

//! Configuration management for Nexus
//!
//! Handles CLI argument parsing, config file loading, and defaults.
//! Values can also be looked up by dotted path (`network.listen_port`).

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::peer::Role;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML encoding error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing configuration key: {0}")]
    Missing(String),
}

#[derive(Parser, Debug)]
#[command(name = "nexus")]
#[command(about = "Gossip-synchronized peer directory node", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the Nexus node
    Start(StartCommand),
}

#[derive(Parser, Debug, Clone, Default)]
pub struct StartCommand {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Data directory for node identity and state
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// TCP port for the nexus listener
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Peer directory file
    #[arg(long)]
    pub peer_cache_file: Option<PathBuf>,

    /// Seconds between tap-sync rounds
    #[arg(long)]
    pub sync_interval: Option<u64>,

    /// Disable UPnP port forwarding
    #[arg(long)]
    pub no_upnp: bool,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_port: u16,
    pub bind_address: String,
    pub enable_upnp: bool,
    /// Seconds between tap-sync rounds
    pub peer_discovery_interval: u64,
    /// Seconds a public address lookup stays valid
    pub public_ip_ttl: u64,
    pub ipv4_echo_url: String,
    pub ipv6_echo_url: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 51613,
            bind_address: "0.0.0.0".to_string(),
            enable_upnp: true,
            peer_discovery_interval: 60,
            public_ip_ttl: 300,
            ipv4_echo_url: "https://api.ipify.org".to_string(),
            ipv6_echo_url: "https://api64.ipify.org".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub peer_cache_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            peer_cache_file: PathBuf::from("./data/peers/peers.yaml"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Fixed node id; generated and persisted under `data_dir` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Create config from CLI arguments, reading `--config` first if given
    pub fn from_cli() -> Result<Self, ConfigError> {
        let cli = Cli::parse();

        match cli.command {
            Commands::Start(cmd) => Self::from_start_command(cmd),
        }
    }

    /// Build a config from a parsed `start` command
    pub fn from_start_command(cmd: StartCommand) -> Result<Self, ConfigError> {
        let base = match &cmd.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        let config = base.with_overrides(cmd);
        config.validate()?;
        Ok(config)
    }

    /// Load config from TOML file; missing keys take their defaults
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    fn with_overrides(mut self, cmd: StartCommand) -> Self {
        if let Some(dir) = cmd.data_dir {
            self.storage.data_dir = dir;
        }
        if let Some(port) = cmd.listen_port {
            self.network.listen_port = port;
        }
        if let Some(file) = cmd.peer_cache_file {
            self.storage.peer_cache_file = file;
        }
        if let Some(secs) = cmd.sync_interval {
            self.network.peer_discovery_interval = secs;
        }
        if cmd.no_upnp {
            self.network.enable_upnp = false;
        }
        if let Some(level) = cmd.log_level {
            self.logging.level = level;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.listen_port == 0 {
            return Err(ConfigError::Invalid(
                "network.listen_port must be non-zero".to_string(),
            ));
        }
        if self.network.peer_discovery_interval == 0 {
            return Err(ConfigError::Invalid(
                "network.peer_discovery_interval must be non-zero".to_string(),
            ));
        }
        if self.storage.peer_cache_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "storage.peer_cache_file must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Look up a value by dotted path, e.g. `storage.peer_cache_file`
    pub fn get(&self, key: &str) -> Result<toml::Value, ConfigError> {
        let mut current = toml::Value::try_from(self)?;
        for part in key.split('.') {
            current = match current {
                toml::Value::Table(mut table) => table
                    .remove(part)
                    .ok_or_else(|| ConfigError::Missing(key.to_string()))?,
                _ => return Err(ConfigError::Missing(key.to_string())),
            };
        }
        Ok(current)
    }

    pub fn listen_port(&self) -> u16 {
        self.network.listen_port
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.network.peer_discovery_interval)
    }

    pub fn public_ip_ttl(&self) -> Duration {
        Duration::from_secs(self.network.public_ip_ttl)
    }
}

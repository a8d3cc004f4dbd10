//! Configuration types for wg-provisioner
//!
//! This module defines all configuration structures used by the service.
//! Configuration is loaded from JSON files and validated at startup.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::peer::ip_allocator::{parse_subnet, DEFAULT_CLIENT_NETWORK};
use crate::subscription::validation::{validate_endpoint, validate_wg_key};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// `WireGuard` interface and server identity
    pub wireguard: WireguardConfig,

    /// Database and artifact locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Expiry sweeper schedule
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Lifecycle worker limits
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Notification delivery
    #[serde(default)]
    pub notify: NotifyConfig,

    /// IPC configuration
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.wireguard.validate()?;
        self.storage.validate()?;
        self.sweeper.validate()?;
        self.lifecycle.validate()?;
        self.ipc.validate()?;
        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            wireguard: WireguardConfig::default(),
            storage: StorageConfig::default(),
            sweeper: SweeperConfig::default(),
            lifecycle: LifecycleConfig::default(),
            notify: NotifyConfig::default(),
            ipc: IpcConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Which control backend drives the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlBackend {
    /// Shell out to the `wg` tool
    #[default]
    Cli,
    /// Keep peers in memory (no interface is touched)
    Memory,
}

/// `WireGuard` configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireguardConfig {
    /// Interface name
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Persistent peer-config file of the interface
    #[serde(default = "default_peer_config_path")]
    pub peer_config_path: PathBuf,

    /// Network client addresses are allocated from
    #[serde(default = "default_client_network")]
    pub client_network_cidr: String,

    /// Server public key written into client configs
    pub server_public_key: String,

    /// Server endpoint (`host:port`) written into client configs
    pub server_endpoint: String,

    /// DNS server written into client configs
    #[serde(default = "default_dns_address")]
    pub dns_address: String,

    /// Path or name of the `wg` tool
    #[serde(default = "default_wg_binary")]
    pub wg_binary: String,

    /// Upper bound for a single `wg` invocation
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Control backend
    #[serde(default)]
    pub backend: ControlBackend,
}

impl WireguardConfig {
    /// Validate `WireGuard` configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.is_empty() || self.interface.len() > 15 {
            return Err(ConfigError::ValidationError(format!(
                "Interface name must be 1-15 characters: '{}'",
                self.interface
            )));
        }
        if !self
            .interface
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ConfigError::ValidationError(format!(
                "Invalid interface name: '{}'",
                self.interface
            )));
        }

        parse_subnet(&self.client_network_cidr)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        validate_wg_key(&self.server_public_key).map_err(|e| {
            ConfigError::ValidationError(format!("server_public_key: {e}"))
        })?;
        validate_endpoint(&self.server_endpoint)
            .map_err(|e| ConfigError::ValidationError(format!("server_endpoint: {e}")))?;

        if self.dns_address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "dns_address cannot be empty".into(),
            ));
        }

        if self.command_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "command_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Get command timeout as Duration
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            peer_config_path: default_peer_config_path(),
            client_network_cidr: default_client_network(),
            // Placeholder; replace with the real server key
            server_public_key: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".into(),
            server_endpoint: "vpn.example.com:51820".into(),
            dns_address: default_dns_address(),
            wg_binary: default_wg_binary(),
            command_timeout_secs: default_command_timeout_secs(),
            backend: ControlBackend::Cli,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Directory for client config artifacts
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
}

impl StorageConfig {
    /// Validate storage configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "database_path cannot be empty".into(),
            ));
        }
        if self.config_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "config_dir cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            config_dir: default_config_dir(),
        }
    }
}

/// Expiry sweeper schedule
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SweeperConfig {
    /// Run the sweeper at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweep ticks
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,

    /// Run a reconciliation pass every N ticks (0 disables)
    #[serde(default = "default_reconcile_every")]
    pub reconcile_every: u32,
}

impl SweeperConfig {
    /// Validate sweeper configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sweeper interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Get tick interval as Duration
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval_secs(),
            reconcile_every: default_reconcile_every(),
        }
    }
}

/// Lifecycle worker limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    /// Pending requests the worker queue holds
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Upper bound for one request, queueing included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl LifecycleConfig {
    /// Validate lifecycle configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue_capacity must be greater than 0".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Get request timeout as Duration
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Notification delivery
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotifyConfig {
    /// Spool directory for an external mailer; log-only when unset
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

/// IPC configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpcConfig {
    /// Path to Unix socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Socket file mode (octal, e.g., 0o660)
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Enable IPC server
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl IpcConfig {
    /// Validate IPC configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "IPC socket path cannot be empty when IPC is enabled".into(),
            ));
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_message_size must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            enabled: true,
            max_message_size: default_max_message_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

// Default value functions for serde
const fn default_true() -> bool {
    true
}

fn default_interface() -> String {
    "wg0".into()
}

fn default_peer_config_path() -> PathBuf {
    PathBuf::from("/etc/wireguard/wg0.conf")
}

fn default_client_network() -> String {
    DEFAULT_CLIENT_NETWORK.into()
}

fn default_dns_address() -> String {
    "8.8.8.8".into()
}

fn default_wg_binary() -> String {
    "wg".into()
}

const fn default_command_timeout_secs() -> u64 {
    10
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/wg-provisioner/subscriptions.db")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/var/lib/wg-provisioner/configs")
}

const fn default_sweep_interval_secs() -> u64 {
    10
}

const fn default_reconcile_every() -> u32 {
    30
}

const fn default_queue_capacity() -> usize {
    64
}

const fn default_request_timeout_secs() -> u64 {
    60
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/wg-provisioner.sock")
}

const fn default_socket_mode() -> u32 {
    0o660
}

const fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "json".into()
}

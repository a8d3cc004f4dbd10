//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "WG_PROVISIONER_";

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: interface={}, network={}, backend={:?}",
        config.wireguard.interface, config.wireguard.client_network_cidr, config.wireguard.backend
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `WG_PROVISIONER_LOG_LEVEL`: Override log level
/// - `WG_PROVISIONER_DATABASE_PATH`: Override database path
/// - `WG_PROVISIONER_IPC_SOCKET`: Override IPC socket path
/// - `WG_PROVISIONER_SERVER_ENDPOINT`: Override server endpoint
/// - `WG_PROVISIONER_SERVER_PUBLIC_KEY`: Override server public key
/// - `WG_PROVISIONER_CLIENT_NETWORK_CIDR`: Override client network
///
/// # Errors
///
/// Returns `ConfigError` if loading fails or an override is invalid.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides looked up through `lookup`, then re-validate
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

    if let Some(level) = var("LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(path) = var("DATABASE_PATH") {
        config.storage.database_path = path.into();
        debug!(
            "Database path overridden to {:?}",
            config.storage.database_path
        );
    }

    if let Some(socket) = var("IPC_SOCKET") {
        config.ipc.socket_path = socket.into();
        debug!("IPC socket path overridden to {:?}", config.ipc.socket_path);
    }

    if let Some(endpoint) = var("SERVER_ENDPOINT") {
        config.wireguard.server_endpoint = endpoint;
        debug!(
            "Server endpoint overridden to {}",
            config.wireguard.server_endpoint
        );
    }

    if let Some(key) = var("SERVER_PUBLIC_KEY") {
        config.wireguard.server_public_key = key;
        debug!("Server public key overridden");
    }

    if let Some(cidr) = var("CLIENT_NETWORK_CIDR") {
        config.wireguard.client_network_cidr = cidr;
        debug!(
            "Client network overridden to {}",
            config.wireguard.client_network_cidr
        );
    }

    // Re-validate after overrides, naming the variable on failure
    config.validate().map_err(|e| ConfigError::EnvError {
        name: format!("{ENV_PREFIX}*"),
        reason: e.to_string(),
    })
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}

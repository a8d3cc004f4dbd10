//! Configuration module for wg-provisioner
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use wg_provisioner::config::{load_config, Config};
//!
//! let config = load_config("/etc/wg-provisioner/config.json").unwrap();
//! println!("Interface: {}", config.wireguard.interface);
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str,
    load_config_with_env, ENV_PREFIX,
};
pub use types::{
    Config, ControlBackend, IpcConfig, LifecycleConfig, LogConfig, NotifyConfig, StorageConfig,
    SweeperConfig, WireguardConfig,
};

//! wg-provisioner: subscription-driven `WireGuard` peer provisioning
//!
//! Turns confirmed payments into `WireGuard` peers and tears them down when
//! the subscription lapses.
//!
//! # Features
//!
//! - **Address Pool**: explicit client address allocation from one network
//! - **Peer Store**: live peer registration plus an idempotent peer-config file
//! - **Config Artifacts**: one owner-only client config per subscription
//! - **Lifecycle**: pending → paid → expired → paid, with stacked renewals
//! - **Expiry Sweeper**: periodic revocation of lapsed subscriptions
//! - **Reconciliation**: converges live peers with the datastore
//! - **IPC Control**: Unix socket control surface
//!
//! # Architecture
//!
//! ```text
//! payment processor ─► IPC ─► LifecycleHandle ─► worker ─► coordinator
//!                                    ▲                       │
//!                         ExpirySweeper (timer)     allocator · peers · SQLite
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use tokio::sync::broadcast;
//! use wg_provisioner::config::load_config;
//! use wg_provisioner::lifecycle::{spawn_worker, PaymentConfirmation};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/wg-provisioner/config.json")?;
//! let coordinator = wg_provisioner::build_coordinator(&config)?;
//!
//! let (shutdown_tx, _) = broadcast::channel(1);
//! let (handle, _task) = spawn_worker(coordinator, &config.lifecycle, shutdown_tx.subscribe());
//!
//! let outcome = handle.create_or_renew(PaymentConfirmation::new("a@x.com", 1)).await?;
//! println!("config written to {:?}", outcome.config_path);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`ipc`]: IPC server and protocol
//! - [`lifecycle`]: Coordinator, worker, sweeper and reconciliation
//! - [`peer`]: Address allocation, keys, peer store and config artifacts
//! - [`subscription`]: Subscription records, plans and the order repository

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod ipc;
pub mod lifecycle;
pub mod peer;
pub mod subscription;

// Re-export commonly used types at the crate root
pub use config::{Config, WireguardConfig};
pub use error::{
    ConfigError, ControlError, IpcError, LifecycleError, ProvisionerError, RepositoryError,
};
pub use ipc::{IpcClient, IpcCommand, IpcResponse, IpcServer};
pub use lifecycle::{
    spawn_worker, ExpirySweeper, LifecycleCoordinator, LifecycleHandle, PaymentConfirmation,
};
pub use peer::{ClientIpAllocator, PeerStore, WgControl};
pub use subscription::{OrderRepository, Subscription, SubscriptionStatus};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Assemble a seeded coordinator from configuration
///
/// Opens the datastore, selects the control backend and notifier, and
/// seeds the address pool from the peer-config file and existing rows.
///
/// # Errors
///
/// Returns `ProvisionerError` if the datastore cannot be opened, the client
/// network is invalid, or the peer-config file cannot be read.
pub fn build_coordinator(config: &Config) -> error::Result<LifecycleCoordinator> {
    let repo = OrderRepository::open(&config.storage.database_path)?;
    let peers = PeerStore::new(
        peer::control_from_config(&config.wireguard),
        &config.wireguard.peer_config_path,
    );
    let generator = peer::ConfigGenerator::from_config(&config.wireguard, &config.storage.config_dir);
    let allocator = ClientIpAllocator::new(&config.wireguard.client_network_cidr)
        .map_err(LifecycleError::from)?;

    let mut coordinator = LifecycleCoordinator::new(
        repo,
        peers,
        generator,
        allocator,
        Arc::new(subscription::SystemClock),
        lifecycle::notifier_from_config(&config.notify),
    );
    coordinator.seed_allocator()?;
    Ok(coordinator)
}

//! `WireGuard` control interface
//!
//! [`WgControl`] is the seam between the lifecycle and the live interface.
//! [`WgCli`] drives the `wg` tool; every invocation is bounded by the
//! configured command timeout and the child is killed if it overruns.
//! [`MemoryControl`] keeps peers in a map and is used when no interface is
//! available (tests, dry runs).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::keys::{generate_keypair, KeyPair};
use crate::config::{ControlBackend, WireguardConfig};
use crate::error::ControlError;
use crate::subscription::validation::validate_wg_key;

/// Operations on the live `WireGuard` interface
#[async_trait]
pub trait WgControl: Send + Sync {
    /// Create a fresh client keypair
    async fn generate_keypair(&self) -> Result<KeyPair, ControlError>;

    /// Register a peer with a single allowed address
    async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<(), ControlError>;

    /// Deregister a peer
    async fn remove_peer(&self, public_key: &str) -> Result<(), ControlError>;

    /// Public keys of all live peers
    async fn list_peers(&self) -> Result<Vec<String>, ControlError>;

    /// Backend name for status output
    fn backend(&self) -> &'static str;
}

/// Build the control backend selected in configuration
#[must_use]
pub fn control_from_config(config: &WireguardConfig) -> Arc<dyn WgControl> {
    match config.backend {
        ControlBackend::Cli => Arc::new(WgCli::from_config(config)),
        ControlBackend::Memory => Arc::new(MemoryControl::new()),
    }
}

/// Control backend that shells out to the `wg` tool
#[derive(Debug, Clone)]
pub struct WgCli {
    binary: String,
    interface: String,
    timeout: Duration,
}

impl WgCli {
    /// Create a new CLI backend
    pub fn new(binary: impl Into<String>, interface: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            interface: interface.into(),
            timeout,
        }
    }

    /// Create from the `wireguard` config section
    #[must_use]
    pub fn from_config(config: &WireguardConfig) -> Self {
        Self::new(&config.wg_binary, &config.interface, config.command_timeout())
    }

    /// Run the tool, optionally feeding `input` on stdin, and return trimmed stdout
    async fn run(&self, args: &[&str], input: Option<&str>) -> Result<String, ControlError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        trace!("Running {}", command);

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControlError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        let stdin = child.stdin.take();
        let exchange = async move {
            if let (Some(mut stdin), Some(input)) = (stdin, input) {
                stdin.write_all(input.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
            }
            child.wait_with_output().await
        };

        let output = match timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => return Err(ControlError::timeout(command, self.timeout)),
        };

        if !output.status.success() {
            return Err(ControlError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl WgControl for WgCli {
    async fn generate_keypair(&self) -> Result<KeyPair, ControlError> {
        let private_key = self.run(&["genkey"], None).await?;
        validate_wg_key(&private_key)
            .map_err(|e| ControlError::invalid_output("wg genkey", e.to_string()))?;

        let public_key = self.run(&["pubkey"], Some(&private_key)).await?;
        validate_wg_key(&public_key)
            .map_err(|e| ControlError::invalid_output("wg pubkey", e.to_string()))?;

        Ok(KeyPair {
            private_key,
            public_key,
        })
    }

    async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<(), ControlError> {
        let allowed = format!("{address}/32");
        self.run(
            &[
                "set",
                &self.interface,
                "peer",
                public_key,
                "allowed-ips",
                &allowed,
            ],
            None,
        )
        .await?;
        debug!(%address, "Registered peer {} on {}", public_key, self.interface);
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), ControlError> {
        self.run(&["set", &self.interface, "peer", public_key, "remove"], None)
            .await?;
        debug!("Removed peer {} from {}", public_key, self.interface);
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<String>, ControlError> {
        let out = self.run(&["show", &self.interface, "peers"], None).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    fn backend(&self) -> &'static str {
        "cli"
    }
}

/// In-memory control backend
///
/// Records every call so tests can assert on them, and can be told to fail
/// peer registration or key generation.
#[derive(Debug, Default)]
pub struct MemoryControl {
    peers: Mutex<HashMap<String, Ipv4Addr>>,
    add_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    fail_add: AtomicBool,
    fail_keygen: AtomicBool,
    add_delay: Mutex<Option<Duration>>,
}

impl MemoryControl {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `add_peer` fail until reset
    pub fn set_fail_add(&self, fail: bool) {
        self.fail_add.store(fail, Ordering::SeqCst);
    }

    /// Make `generate_keypair` fail until reset
    pub fn set_fail_keygen(&self, fail: bool) {
        self.fail_keygen.store(fail, Ordering::SeqCst);
    }

    /// Make every `add_peer` take at least `delay`
    pub fn set_add_delay(&self, delay: Option<Duration>) {
        *self.add_delay.lock() = delay;
    }

    /// Snapshot of live peers
    #[must_use]
    pub fn peers(&self) -> HashMap<String, Ipv4Addr> {
        self.peers.lock().clone()
    }

    /// Whether a key is live
    #[must_use]
    pub fn has_peer(&self, public_key: &str) -> bool {
        self.peers.lock().contains_key(public_key)
    }

    /// Number of `add_peer` calls, failed ones included
    #[must_use]
    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    /// Number of `remove_peer` calls
    #[must_use]
    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// Insert a peer directly, bypassing call accounting
    pub fn insert_peer(&self, public_key: impl Into<String>, address: Ipv4Addr) {
        self.peers.lock().insert(public_key.into(), address);
    }
}

#[async_trait]
impl WgControl for MemoryControl {
    async fn generate_keypair(&self) -> Result<KeyPair, ControlError> {
        if self.fail_keygen.load(Ordering::SeqCst) {
            return Err(ControlError::Failed {
                command: "wg genkey".into(),
                status: "exit status: 1".into(),
                stderr: "key generation disabled".into(),
            });
        }
        Ok(generate_keypair())
    }

    async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<(), ControlError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.add_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(ControlError::Failed {
                command: "wg set".into(),
                status: "exit status: 1".into(),
                stderr: "Unable to modify interface".into(),
            });
        }
        self.peers.lock().insert(public_key.to_string(), address);
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), ControlError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.peers.lock().remove(public_key);
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<String>, ControlError> {
        let mut keys: Vec<String> = self.peers.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

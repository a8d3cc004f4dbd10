//! Peer store
//!
//! Registers peers on the live interface through a [`WgControl`] backend
//! and mirrors them into the persistent peer-config file so they survive
//! an interface restart. Appends are idempotent: a key that already has a
//! `[Peer]` block is never written twice. Plain removal leaves the file
//! alone; only an administrative revoke prunes the block via
//! [`PeerStore::forget`].

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::conf::{addresses, key_value};
use super::control::WgControl;
use super::keys::KeyPair;
use crate::error::ControlError;

/// Live peers plus the persistent peer-config file
#[derive(Clone)]
pub struct PeerStore {
    control: Arc<dyn WgControl>,
    config_path: PathBuf,
}

impl std::fmt::Debug for PeerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStore")
            .field("backend", &self.control.backend())
            .field("config_path", &self.config_path)
            .finish()
    }
}

impl PeerStore {
    /// Create a store over a control backend and a peer-config file
    pub fn new(control: Arc<dyn WgControl>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            control,
            config_path: config_path.into(),
        }
    }

    /// Path of the persistent peer-config file
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Name of the control backend
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.control.backend()
    }

    /// Create a fresh client keypair
    pub async fn generate_keypair(&self) -> Result<KeyPair, ControlError> {
        self.control.generate_keypair().await
    }

    /// Register a peer and record it in the peer-config file
    ///
    /// The file is only touched after the live registration succeeded.
    pub async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<(), ControlError> {
        self.control.add_peer(public_key, address).await?;
        if append_peer_block(&self.config_path, public_key, address)? {
            info!(%address, "Added peer {} to {:?}", public_key, self.config_path);
        } else {
            debug!("Peer {} already present in {:?}", public_key, self.config_path);
        }
        Ok(())
    }

    /// Deregister a peer from the live interface
    pub async fn remove_peer(&self, public_key: &str) -> Result<(), ControlError> {
        self.control.remove_peer(public_key).await
    }

    /// Public keys currently registered on the interface
    pub async fn live_peers(&self) -> Result<HashSet<String>, ControlError> {
        Ok(self.control.list_peers().await?.into_iter().collect())
    }

    /// Drop a peer's block from the peer-config file
    ///
    /// Returns whether a block was removed.
    pub fn forget(&self, public_key: &str) -> Result<bool, ControlError> {
        let text = match fs::read_to_string(&self.config_path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let (rewritten, removed) = strip_peer_block(&text, public_key);
        if removed {
            replace_file(&self.config_path, &rewritten)?;
            info!("Removed peer {} from {:?}", public_key, self.config_path);
        }
        Ok(removed)
    }

    /// Addresses referenced by the peer-config file
    ///
    /// Both `AllowedIPs` of peers and the interface `Address` count as used.
    /// A missing file yields an empty set.
    pub fn used_addresses(&self) -> Result<Vec<Ipv4Addr>, ControlError> {
        match fs::read_to_string(&self.config_path) {
            Ok(text) => Ok(used_addresses_in(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Peer config {:?} does not exist yet", self.config_path);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Number of `[Peer]` blocks carrying the given key
    pub fn block_count(&self, public_key: &str) -> Result<usize, ControlError> {
        match fs::read_to_string(&self.config_path) {
            Ok(text) => Ok(sections(&text)
                .iter()
                .filter(|section| is_peer_block_for(section, public_key))
                .count()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// Append a `[Peer]` block unless one with this key exists; returns whether it wrote
fn append_peer_block(path: &Path, public_key: &str, address: Ipv4Addr) -> io::Result<bool> {
    match fs::read_to_string(path) {
        Ok(text) => {
            if sections(&text)
                .iter()
                .any(|section| is_peer_block_for(section, public_key))
            {
                return Ok(false);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }
        Err(e) => return Err(e),
    }

    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    write!(
        file,
        "\n[Peer]\nPublicKey = {public_key}\nAllowedIPs = {address}/32\n"
    )?;
    Ok(true)
}

fn used_addresses_in(text: &str) -> Vec<Ipv4Addr> {
    text.lines()
        .filter_map(key_value)
        .filter(|(key, _)| *key == "AllowedIPs" || *key == "Address")
        .flat_map(|(_, value)| addresses(value).collect::<Vec<_>>())
        .collect()
}

/// Split a config into sections; each starts at a `[...]` header
/// (the first may be a header-less preamble)
fn sections(text: &str) -> Vec<Vec<&str>> {
    let mut out: Vec<Vec<&str>> = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with('[') || out.is_empty() {
            out.push(Vec::new());
        }
        if let Some(current) = out.last_mut() {
            current.push(line);
        }
    }
    out
}

fn is_peer_block_for(section: &[&str], public_key: &str) -> bool {
    let is_peer = section
        .first()
        .is_some_and(|header| header.trim().eq_ignore_ascii_case("[Peer]"));
    is_peer
        && section
            .iter()
            .filter_map(|line| key_value(line))
            .any(|(key, value)| key == "PublicKey" && value == public_key)
}

fn strip_peer_block(text: &str, public_key: &str) -> (String, bool) {
    let mut removed = false;
    let mut kept: Vec<&str> = Vec::new();

    for section in sections(text) {
        if is_peer_block_for(&section, public_key) {
            removed = true;
        } else {
            kept.extend(section);
        }
    }

    while kept.last().is_some_and(|line| line.trim().is_empty()) {
        kept.pop();
    }
    let mut rewritten = kept.join("\n");
    if !rewritten.is_empty() {
        rewritten.push('\n');
    }
    (rewritten, removed)
}

/// Replace a file through a temporary sibling, keeping its permissions
fn replace_file(path: &Path, text: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, text)?;
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(&tmp, meta.permissions())?;
    }
    fs::rename(&tmp, path)
}

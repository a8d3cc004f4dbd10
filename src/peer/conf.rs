//! Client configuration artifacts
//!
//! Renders the per-client `wg-quick` configuration, writes it to the
//! configured directory with owner-only permissions, and parses it back
//! when a subscription is reactivated. Rendering is pure: the same inputs
//! always produce the same text.

use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::WireguardConfig;

/// Routes sent through the tunnel
const CLIENT_ALLOWED_IPS: &str = "0.0.0.0/0";

/// Render a client configuration
///
/// ```
/// use std::net::Ipv4Addr;
/// use wg_provisioner::peer::conf::{parse_client_config, render_client_config};
///
/// let text = render_client_config(
///     "a@x.com",
///     "1 month",
///     Ipv4Addr::new(10, 0, 0, 2),
///     "cHJpdmF0ZQ==",
///     "c2VydmVy",
///     "vpn.example.com:51820",
///     "1.1.1.1",
/// );
/// let parsed = parse_client_config(&text);
/// assert_eq!(parsed.address, Some(Ipv4Addr::new(10, 0, 0, 2)));
/// ```
#[must_use]
pub fn render_client_config(
    identity: &str,
    plan: &str,
    client_address: Ipv4Addr,
    private_key: &str,
    server_public_key: &str,
    server_endpoint: &str,
    dns_address: &str,
) -> String {
    format!(
        "[Interface]\n\
         PrivateKey = {private_key}\n\
         Address = {client_address}/32\n\
         DNS = {dns_address}\n\
         \n\
         [Peer]\n\
         PublicKey = {server_public_key}\n\
         Endpoint = {server_endpoint}\n\
         AllowedIPs = {CLIENT_ALLOWED_IPS}\n\
         # Identity: {identity}\n\
         # Plan: {plan}\n"
    )
}

/// Fields recovered from a stored artifact
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedClientConfig {
    pub private_key: Option<String>,
    pub address: Option<Ipv4Addr>,
}

/// Parse the `[Interface]` section of a client configuration
#[must_use]
pub fn parse_client_config(text: &str) -> ParsedClientConfig {
    let mut parsed = ParsedClientConfig::default();
    let mut in_interface = false;

    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_interface = line.eq_ignore_ascii_case("[Interface]");
            continue;
        }
        if !in_interface {
            continue;
        }
        match key_value(line) {
            Some(("PrivateKey", value)) => parsed.private_key = Some(value.to_string()),
            Some(("Address", value)) => parsed.address = addresses(value).next(),
            _ => {}
        }
    }
    parsed
}

/// Split a `Key = Value` line; comments and headers yield `None`
pub(crate) fn key_value(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.starts_with('#') || line.starts_with('[') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}

/// IPv4 addresses in a comma-separated address list, prefixes stripped
pub(crate) fn addresses(value: &str) -> impl Iterator<Item = Ipv4Addr> + '_ {
    value
        .split(',')
        .filter_map(|entry| entry.trim().split('/').next()?.parse().ok())
}

/// Renders and stores client artifacts for one server
#[derive(Debug, Clone)]
pub struct ConfigGenerator {
    config_dir: PathBuf,
    server_public_key: String,
    server_endpoint: String,
    dns_address: String,
}

impl ConfigGenerator {
    /// Create a generator writing into `config_dir`
    pub fn new(
        config_dir: impl Into<PathBuf>,
        server_public_key: impl Into<String>,
        server_endpoint: impl Into<String>,
        dns_address: impl Into<String>,
    ) -> Self {
        Self {
            config_dir: config_dir.into(),
            server_public_key: server_public_key.into(),
            server_endpoint: server_endpoint.into(),
            dns_address: dns_address.into(),
        }
    }

    /// Create from the `wireguard` section and the artifact directory
    pub fn from_config(wireguard: &WireguardConfig, config_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            config_dir,
            &wireguard.server_public_key,
            &wireguard.server_endpoint,
            &wireguard.dns_address,
        )
    }

    /// Render the artifact for a client
    #[must_use]
    pub fn render(
        &self,
        identity: &str,
        plan: &str,
        client_address: Ipv4Addr,
        private_key: &str,
    ) -> String {
        render_client_config(
            identity,
            plan,
            client_address,
            private_key,
            &self.server_public_key,
            &self.server_endpoint,
            &self.dns_address,
        )
    }

    /// Where the artifact for an order lives
    #[must_use]
    pub fn artifact_path(&self, order_id: i64) -> PathBuf {
        self.config_dir.join(format!("wg_{order_id}.conf"))
    }

    /// Write an artifact readable and writable by the owner only
    pub fn write_to_storage(&self, order_id: i64, text: &str) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.config_dir)?;
        let path = self.artifact_path(order_id);
        write_private(&path, text)?;
        debug!(order_id, "Saved client config {:?}", path);
        Ok(path)
    }

    /// Read an artifact back; `None` when it is missing or unreadable
    #[must_use]
    pub fn read_artifact(path: &Path) -> Option<(String, ParsedClientConfig)> {
        let text = fs::read_to_string(path).ok()?;
        let parsed = parse_client_config(&text);
        Some((text, parsed))
    }

    /// Delete an artifact; a missing file is not an error
    pub fn remove_artifact(path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(unix)]
fn write_private(path: &Path, text: &str) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(text.as_bytes())?;
    // mode() only applies on creation
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn write_private(path: &Path, text: &str) -> io::Result<()> {
    fs::write(path, text)
}

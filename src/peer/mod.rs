//! Peer provisioning
//!
//! Everything that touches the `WireGuard` side of a subscription:
//!
//! - [`ip_allocator`]: client address allocation from the configured network
//! - [`keys`]: in-process X25519 keys and access tokens
//! - [`control`]: the live-interface control seam (`wg` CLI or in-memory)
//! - [`store`]: live peers plus the persistent peer-config file
//! - [`conf`]: client configuration artifacts

pub mod conf;
pub mod control;
pub mod ip_allocator;
pub mod keys;
pub mod store;

pub use conf::{parse_client_config, render_client_config, ConfigGenerator, ParsedClientConfig};
pub use control::{control_from_config, MemoryControl, WgCli, WgControl};
pub use ip_allocator::{ClientIpAllocator, IpAllocatorError, DEFAULT_CLIENT_NETWORK};
pub use keys::{derive_public_key, generate_access_token, generate_keypair, KeyPair};
pub use store::PeerStore;

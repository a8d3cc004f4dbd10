//! IPC (Inter-Process Communication) module
//!
//! Unix socket control surface for the daemon. The payment processor calls
//! `create_or_renew` here; operators use it for revokes, sweeps and status.
//!
//! # Protocol
//!
//! Messages are length-prefixed JSON:
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: JSON-encoded command or response
//!
//! # Example
//!
//! ```no_run
//! use wg_provisioner::ipc::IpcClient;
//! use wg_provisioner::lifecycle::PaymentConfirmation;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = IpcClient::new("/var/run/wg-provisioner.sock");
//!
//! let outcome = client
//!     .create_or_renew(PaymentConfirmation::new("a@x.com", 1))
//!     .await?;
//! println!("config at {:?}", outcome.config_path);
//! # Ok(())
//! # }
//! ```

mod handler;
mod protocol;
mod server;

pub use handler::{error_code, IpcHandler};
pub use protocol::{
    decode_message, encode_message, ErrorCode, IpcCommand, IpcError, IpcResponse, PlanInfo,
    ServerStatus, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
pub use server::{IpcClient, IpcServer};

//! IPC Protocol definitions
//!
//! This module defines the command and response types used for
//! inter-process communication via Unix socket.

use serde::{Deserialize, Serialize};

use crate::lifecycle::{
    IssuedToken, OwnedSubscription, PaymentConfirmation, ProvisionOutcome, ReconcileReport,
    RedeemedConfig, RevokeOutcome, SweepReport, TrialRequest, WorkerStatus,
};
use crate::subscription::{Plan, PlanDuration, SubscriptionState};

/// IPC command types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcCommand {
    /// Ping to check if the server is alive
    Ping,

    /// Get server status
    Status,

    /// List the purchasable plans
    ListPlans,

    /// Payment confirmed: create, renew or reactivate
    CreateOrRenew(PaymentConfirmation),

    /// Record a checkout before payment
    RegisterCheckout(PaymentConfirmation),

    /// Grant the one-time free trial
    GrantTrial(TrialRequest),

    /// Status and expiry for an identifier
    GetStatus {
        /// Contact identifier
        identifier: String,
    },

    /// Subscriptions and config availability for an owning user
    ListByOwner {
        /// Owning user id
        user_id: i64,
    },

    /// Issue a single-use access token
    IssueAccessToken {
        /// Contact identifier
        identifier: String,
    },

    /// Exchange an access token for the client config
    RedeemAccessToken {
        /// Token returned by `issue_access_token`
        token: String,
    },

    /// Administratively revoke a peer
    Revoke {
        /// Peer public key
        public_key: String,
    },

    /// Converge live peers with subscription rows
    Reconcile,

    /// Run one expiry sweep now
    Sweep,

    /// Shutdown the daemon
    Shutdown,
}

/// IPC response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Pong response to ping
    Pong,

    /// Server status
    Status(ServerStatus),

    /// Plan catalog
    Plans {
        /// Purchasable plans
        plans: Vec<PlanInfo>,
    },

    /// Paid-entry result
    Provisioned(ProvisionOutcome),

    /// Pending checkout recorded
    CheckoutRegistered {
        /// New row id
        order_id: i64,
    },

    /// Subscription status
    SubscriptionStatus(SubscriptionState),

    /// An owner's subscriptions, newest first
    OwnedSubscriptions {
        subscriptions: Vec<OwnedSubscription>,
    },

    /// Newly issued access token
    AccessToken(IssuedToken),

    /// Redeemed client config
    Config(RedeemedConfig),

    /// Revoke result
    Revoked(RevokeOutcome),

    /// Reconciliation result
    ReconcileResult(ReconcileReport),

    /// Sweep result
    SweepResult(SweepReport),

    /// Success response (for commands that don't return data)
    Success {
        /// Optional message
        message: Option<String>,
    },

    /// Error response
    Error(IpcError),
}

impl IpcResponse {
    /// Create a success response with no message
    pub fn success() -> Self {
        Self::Success { message: None }
    }

    /// Create a success response with a message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success {
            message: Some(msg.into()),
        }
    }

    /// Create an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(IpcError {
            code,
            message: message.into(),
        })
    }

    /// Check if this is an error response
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Server status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Daemon version
    pub version: String,
    /// Seconds since start
    pub uptime_secs: u64,
    /// Pool and datastore counters from the lifecycle worker
    #[serde(flatten)]
    pub worker: WorkerStatus,
}

/// One catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanInfo {
    pub id: u32,
    pub label: String,
    pub price: f64,
    pub duration: PlanDuration,
}

impl From<&Plan> for PlanInfo {
    fn from(plan: &Plan) -> Self {
        Self {
            id: plan.id,
            label: plan.label.to_string(),
            price: plan.price,
            duration: plan.duration,
        }
    }
}

/// IPC error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    /// Error code
    pub code: ErrorCode,
    /// Error message
    pub message: String,
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for IpcError {}

/// Error codes for IPC responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Invalid command
    InvalidCommand,
    /// Invalid parameters
    InvalidParameters,
    /// Resource not found
    NotFound,
    /// Resource already exists
    AlreadyExists,
    /// Status change not allowed
    InvalidState,
    /// Access token unknown or spent
    InvalidToken,
    /// No client address left
    PoolExhausted,
    /// Operation failed
    OperationFailed,
    /// The request did not finish in time
    Timeout,
    /// Server is shutting down
    ShuttingDown,
    /// Internal error
    InternalError,
}

/// Message framing for IPC
///
/// Messages are length-prefixed:
/// - 4 bytes: message length (big-endian u32)
/// - N bytes: JSON message
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1 MB
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a message with length prefix
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = u32::try_from(json.len()).map_err(serde::ser::Error::custom)?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode the JSON body of a length-prefixed message
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}

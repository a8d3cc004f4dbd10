//! Subscription record types
//!
//! One structured record shared by the repository, the lifecycle
//! coordinator, the sweeper and the IPC surface. Optional columns are
//! explicit `Option`s so that "not provisioned yet" is visible in the type.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Checkout registered, payment not confirmed yet
    Pending,
    /// Paid and (normally) provisioned
    Paid,
    /// Lapsed; peer revoked
    Expired,
}

impl SubscriptionStatus {
    /// Column value used by the datastore
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

/// A persisted subscription (order) row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Row id
    pub id: i64,
    /// Contact identifier (natural key for "latest subscription")
    pub identifier: String,
    /// Plan id from the catalog
    pub plan_id: u32,
    /// Plan label at the time of the last payment
    pub plan_label: String,
    /// Price paid
    pub price: f64,
    /// Current status
    pub status: SubscriptionStatus,
    /// Client config artifact
    pub config_path: Option<PathBuf>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// End of the validity window (null while pending)
    pub expires_at: Option<DateTime<Utc>>,
    /// Peer public key
    pub public_key: Option<String>,
    /// Assigned client address
    pub client_address: Option<Ipv4Addr>,
    /// Single-use access token
    pub access_token: Option<String>,
    /// Owning user
    pub user_id: Option<i64>,
    /// External messaging identity
    pub messaging_id: Option<i64>,
}

impl Subscription {
    /// Whether the row carries everything needed to re-register its peer
    #[must_use]
    pub fn peer_identity(&self) -> Option<(&str, Ipv4Addr)> {
        match (&self.public_key, self.client_address) {
            (Some(key), Some(addr)) => Some((key.as_str(), addr)),
            _ => None,
        }
    }

    /// Whether the validity window has ended at `now`
    ///
    /// Rows without an expiry never lapse.
    #[must_use]
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp < now)
    }
}

/// Values for a row about to be inserted
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub identifier: String,
    pub plan_id: u32,
    pub plan_label: String,
    pub price: f64,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub user_id: Option<i64>,
    pub messaging_id: Option<i64>,
}

/// Partial update of a subscription row
///
/// `None` leaves a column untouched. For nullable columns the inner
/// `Option` is the new value, so `Some(None)` clears the column.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub status: Option<SubscriptionStatus>,
    pub plan_id: Option<u32>,
    pub plan_label: Option<String>,
    pub price: Option<f64>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub config_path: Option<Option<PathBuf>>,
    pub public_key: Option<Option<String>>,
    pub client_address: Option<Option<Ipv4Addr>>,
    pub access_token: Option<Option<String>>,
    pub user_id: Option<Option<i64>>,
    pub messaging_id: Option<Option<i64>>,
}

impl SubscriptionUpdate {
    /// True when no column would change
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.plan_id.is_none()
            && self.plan_label.is_none()
            && self.price.is_none()
            && self.expires_at.is_none()
            && self.config_path.is_none()
            && self.public_key.is_none()
            && self.client_address.is_none()
            && self.access_token.is_none()
            && self.user_id.is_none()
            && self.messaging_id.is_none()
    }
}

/// Status view returned by `GetStatus`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub status: SubscriptionStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

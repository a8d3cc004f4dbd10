//! Subscription status transitions
//!
//! | From    | To      | Allowed |
//! |---------|---------|---------|
//! | Pending | Paid    | Yes     |
//! | Paid    | Paid    | Yes (renewal) |
//! | Paid    | Expired | Yes     |
//! | Expired | Paid    | Yes (reactivation) |
//! | Expired | Expired | Yes (repeated sweep) |
//! | Pending | Expired | No      |
//! | *any*   | Pending | Only from Pending |

use thiserror::Error;

use super::model::SubscriptionStatus;

/// A transition the state machine forbids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SubscriptionStatus,
    pub to: SubscriptionStatus,
}

/// Validate a status transition
pub fn validate_status_transition(
    from: SubscriptionStatus,
    to: SubscriptionStatus,
) -> Result<(), InvalidTransition> {
    use SubscriptionStatus::{Expired, Paid, Pending};

    let valid = match (from, to) {
        (Pending, Pending | Paid) | (Paid, Paid | Expired) | (Expired, Paid | Expired) => true,
        (Pending, Expired) | (Paid | Expired, Pending) => false,
    };

    if valid {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

/// Boolean form of [`validate_status_transition`]
pub fn can_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
    validate_status_transition(from, to).is_ok()
}

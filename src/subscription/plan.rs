//! Plan catalog and expiry arithmetic
//!
//! The catalog is fixed at compile time. Durations are calendar-aware:
//! adding one month to January 31st lands on the last day of February.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

/// Validity added by one payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "count", rename_all = "snake_case")]
pub enum PlanDuration {
    /// Fixed number of days
    Days(u32),
    /// Calendar months (a year is twelve)
    Months(u32),
}

impl PlanDuration {
    /// Add this duration to `base`, saturating at the maximum representable instant
    #[must_use]
    pub fn add_to(&self, base: DateTime<Utc>) -> DateTime<Utc> {
        let shifted = match *self {
            Self::Days(days) => base.checked_add_signed(Duration::days(i64::from(days))),
            Self::Months(months) => base.checked_add_months(Months::new(months)),
        };
        shifted.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// A catalog entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plan {
    pub id: u32,
    pub label: &'static str,
    pub price: f64,
    pub duration: PlanDuration,
}

/// Paid plans offered at checkout
pub const PLANS: [Plan; 3] = [
    Plan {
        id: 1,
        label: "1 month",
        price: 99.0,
        duration: PlanDuration::Months(1),
    },
    Plan {
        id: 2,
        label: "6 months",
        price: 499.0,
        duration: PlanDuration::Months(6),
    },
    Plan {
        id: 3,
        label: "1 year",
        price: 999.0,
        duration: PlanDuration::Months(12),
    },
];

/// Plan id reserved for the free trial
pub const TRIAL_PLAN_ID: u32 = 0;

/// Free trial grant; never purchasable through `create_or_renew`
pub const TRIAL_PLAN: Plan = Plan {
    id: TRIAL_PLAN_ID,
    label: "3-day trial",
    price: 0.0,
    duration: PlanDuration::Days(3),
};

/// Look up a paid plan by id
#[must_use]
pub fn find_plan(id: u32) -> Option<&'static Plan> {
    PLANS.iter().find(|plan| plan.id == id)
}

/// Compute the new end of the validity window for a paid-entry
///
/// Renewals before expiry stack on the previous end; renewals after
/// expiry (or with no previous end) restart from `now`.
#[must_use]
pub fn extend_expiry(
    previous: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    duration: PlanDuration,
) -> DateTime<Utc> {
    let base = match previous {
        Some(prev) if prev > now => prev,
        _ => now,
    };
    duration.add_to(base)
}

//! Subscription records, plan catalog and persistence
//!
//! # Submodules
//!
//! - [`model`]: the shared subscription record and partial updates
//! - [`plan`]: fixed plan catalog and calendar-aware expiry arithmetic
//! - [`state_machine`]: allowed status transitions
//! - [`validation`]: input validation run before any side effect
//! - [`repository`]: SQLite order repository
//! - [`clock`]: time source for expiry comparisons

pub mod clock;
pub mod model;
pub mod plan;
pub mod repository;
pub mod state_machine;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use model::{
    NewSubscription, Subscription, SubscriptionState, SubscriptionStatus, SubscriptionUpdate,
};
pub use plan::{extend_expiry, find_plan, Plan, PlanDuration, PLANS, TRIAL_PLAN, TRIAL_PLAN_ID};
pub use repository::{OrderRepository, OrderTx};
pub use state_machine::{can_transition, validate_status_transition, InvalidTransition};
pub use validation::ValidationError;

//! Subscription lifecycle
//!
//! # Architecture
//!
//! ```text
//! IPC handler ─┐
//!              ├─► LifecycleHandle ─► mpsc ─► worker ─► LifecycleCoordinator
//! ExpirySweeper┘        (oneshot reply, request timeout)      │
//!                                                 ┌───────────┼─────────────┐
//!                                                 ▼           ▼             ▼
//!                                          ClientIpAllocator PeerStore OrderRepository
//! ```
//!
//! The worker is the only owner of the allocator and the peer-config file,
//! so every mutating use-case runs to completion before the next begins.

pub mod coordinator;
pub mod notify;
pub mod reconcile;
pub mod sweeper;
pub mod worker;

pub use coordinator::{
    IssuedToken, LifecycleCoordinator, OwnedSubscription, PaymentConfirmation, ProvisionOutcome,
    RedeemedConfig, RevokeOutcome, TrialRequest, WorkerStatus,
};
pub use notify::{
    dispatch, notifier_from_config, LogNotifier, Notification, Notifier, ProvisionAction,
    RecordingNotifier, SpoolNotifier,
};
pub use reconcile::ReconcileReport;
pub use sweeper::{ExpirySweeper, SweepReport};
pub use worker::{spawn_worker, LifecycleHandle};

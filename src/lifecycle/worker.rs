//! Lifecycle worker
//!
//! The worker task owns the [`LifecycleCoordinator`] and processes one
//! command at a time from a bounded channel. Every caller (IPC handlers,
//! the expiry sweeper, tests) goes through a cloneable [`LifecycleHandle`],
//! so allocation, peer registration and row persistence never interleave.
//!
//! A request that times out while still queued is dropped before it runs.
//! One that times out while running still completes, so its outcome is
//! unknown to the caller: check `get_status` before submitting it again.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::coordinator::{
    IssuedToken, LifecycleCoordinator, OwnedSubscription, PaymentConfirmation, ProvisionOutcome, RedeemedConfig,
    RevokeOutcome, TrialRequest, WorkerStatus,
};
use super::reconcile::ReconcileReport;
use super::sweeper::SweepReport;
use crate::config::LifecycleConfig;
use crate::error::LifecycleError;
use crate::subscription::model::SubscriptionState;

/// Minimum command queue depth
const MIN_QUEUE_CAPACITY: usize = 1;

type Reply<T> = oneshot::Sender<Result<T, LifecycleError>>;

/// Commands processed by the worker
enum LifecycleCommand {
    CreateOrRenew(PaymentConfirmation, Reply<ProvisionOutcome>),
    RegisterCheckout(PaymentConfirmation, Reply<i64>),
    GrantTrial(TrialRequest, Reply<ProvisionOutcome>),
    GetStatus(String, Reply<SubscriptionState>),
    ListByOwner(i64, Reply<Vec<OwnedSubscription>>),
    IssueAccessToken(String, Reply<IssuedToken>),
    RedeemAccessToken(String, Reply<RedeemedConfig>),
    Revoke(String, Reply<RevokeOutcome>),
    Sweep(Reply<SweepReport>),
    Reconcile(Reply<ReconcileReport>),
    Status(Reply<WorkerStatus>),
}

impl LifecycleCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::CreateOrRenew(..) => "create_or_renew",
            Self::RegisterCheckout(..) => "register_checkout",
            Self::GrantTrial(..) => "grant_trial",
            Self::GetStatus(..) => "get_status",
            Self::ListByOwner(..) => "list_by_owner",
            Self::IssueAccessToken(..) => "issue_access_token",
            Self::RedeemAccessToken(..) => "redeem_access_token",
            Self::Revoke(..) => "revoke",
            Self::Sweep(..) => "sweep",
            Self::Reconcile(..) => "reconcile",
            Self::Status(..) => "status",
        }
    }

    /// The caller stopped waiting for the reply
    fn is_abandoned(&self) -> bool {
        match self {
            Self::CreateOrRenew(_, reply) | Self::GrantTrial(_, reply) => reply.is_closed(),
            Self::RegisterCheckout(_, reply) => reply.is_closed(),
            Self::GetStatus(_, reply) => reply.is_closed(),
            Self::ListByOwner(_, reply) => reply.is_closed(),
            Self::IssueAccessToken(_, reply) => reply.is_closed(),
            Self::RedeemAccessToken(_, reply) => reply.is_closed(),
            Self::Revoke(_, reply) => reply.is_closed(),
            Self::Sweep(reply) => reply.is_closed(),
            Self::Reconcile(reply) => reply.is_closed(),
            Self::Status(reply) => reply.is_closed(),
        }
    }
}

/// Cloneable front door to the lifecycle worker
#[derive(Clone)]
pub struct LifecycleHandle {
    sender: mpsc::Sender<LifecycleCommand>,
    timeout: Duration,
}

impl LifecycleHandle {
    /// Confirm a payment: create, renew or reactivate a subscription
    pub async fn create_or_renew(
        &self,
        request: PaymentConfirmation,
    ) -> Result<ProvisionOutcome, LifecycleError> {
        self.request("create_or_renew", |reply| {
            LifecycleCommand::CreateOrRenew(request, reply)
        })
        .await
    }

    /// Record a pending checkout
    pub async fn register_checkout(&self, request: PaymentConfirmation) -> Result<i64, LifecycleError> {
        self.request("register_checkout", |reply| {
            LifecycleCommand::RegisterCheckout(request, reply)
        })
        .await
    }

    /// Grant the one-time free trial
    pub async fn grant_trial(&self, request: TrialRequest) -> Result<ProvisionOutcome, LifecycleError> {
        self.request("grant_trial", |reply| LifecycleCommand::GrantTrial(request, reply))
            .await
    }

    /// Status and expiry for an identifier
    pub async fn get_status(&self, identifier: impl Into<String>) -> Result<SubscriptionState, LifecycleError> {
        let identifier = identifier.into();
        self.request("get_status", |reply| LifecycleCommand::GetStatus(identifier, reply))
            .await
    }

    /// Subscriptions owned by a user
    pub async fn list_by_owner(&self, user_id: i64) -> Result<Vec<OwnedSubscription>, LifecycleError> {
        self.request("list_by_owner", |reply| LifecycleCommand::ListByOwner(user_id, reply))
            .await
    }

    /// Issue a single-use access token
    pub async fn issue_access_token(
        &self,
        identifier: impl Into<String>,
    ) -> Result<IssuedToken, LifecycleError> {
        let identifier = identifier.into();
        self.request("issue_access_token", |reply| {
            LifecycleCommand::IssueAccessToken(identifier, reply)
        })
        .await
    }

    /// Redeem an access token for the config text
    pub async fn redeem_access_token(
        &self,
        token: impl Into<String>,
    ) -> Result<RedeemedConfig, LifecycleError> {
        let token = token.into();
        self.request("redeem_access_token", |reply| {
            LifecycleCommand::RedeemAccessToken(token, reply)
        })
        .await
    }

    /// Revoke a peer by public key
    pub async fn revoke(&self, public_key: impl Into<String>) -> Result<RevokeOutcome, LifecycleError> {
        let public_key = public_key.into();
        self.request("revoke", |reply| LifecycleCommand::Revoke(public_key, reply))
            .await
    }

    /// Run one sweep pass
    pub async fn sweep(&self) -> Result<SweepReport, LifecycleError> {
        self.request("sweep", LifecycleCommand::Sweep).await
    }

    /// Run one reconciliation pass
    pub async fn reconcile(&self) -> Result<ReconcileReport, LifecycleError> {
        self.request("reconcile", LifecycleCommand::Reconcile).await
    }

    /// Pool and datastore counters
    pub async fn status(&self) -> Result<WorkerStatus, LifecycleError> {
        self.request("status", LifecycleCommand::Status).await
    }

    /// Submit a command and wait for its reply, bounded by the request timeout
    async fn request<T, F>(&self, operation: &'static str, build: F) -> Result<T, LifecycleError>
    where
        F: FnOnce(Reply<T>) -> LifecycleCommand,
    {
        let (tx, rx) = oneshot::channel();
        let exchange = async {
            if self.sender.send(build(tx)).await.is_err() {
                return Err(LifecycleError::WorkerUnavailable);
            }
            trace!("Lifecycle command {} queued", operation);
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(LifecycleError::WorkerUnavailable),
            }
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::Timeout {
                operation,
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }
}

/// Spawn the lifecycle worker
///
/// The worker stops when a shutdown signal arrives or every handle is dropped.
pub fn spawn_worker(
    coordinator: LifecycleCoordinator,
    config: &LifecycleConfig,
    shutdown_rx: broadcast::Receiver<()>,
) -> (LifecycleHandle, JoinHandle<()>) {
    let capacity = config.queue_capacity.max(MIN_QUEUE_CAPACITY);
    let (sender, receiver) = mpsc::channel(capacity);
    let task = tokio::spawn(run(coordinator, receiver, shutdown_rx));
    let handle = LifecycleHandle {
        sender,
        timeout: config.request_timeout(),
    };
    (handle, task)
}

async fn run(
    mut coordinator: LifecycleCoordinator,
    mut receiver: mpsc::Receiver<LifecycleCommand>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Lifecycle worker started");

    loop {
        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    debug!("All lifecycle handles dropped");
                    break;
                };
                execute(&mut coordinator, command).await;
            }
            _ = shutdown_rx.recv() => {
                info!("Lifecycle worker shutdown signal received");
                break;
            }
        }
    }

    info!("Lifecycle worker stopped");
}

async fn execute(coordinator: &mut LifecycleCoordinator, command: LifecycleCommand) {
    let name = command.name();
    if command.is_abandoned() {
        warn!("Skipping {}: the caller timed out while it was queued", name);
        return;
    }
    trace!("Executing lifecycle command {}", name);

    let delivered = match command {
        LifecycleCommand::CreateOrRenew(request, reply) => {
            reply.send(coordinator.create_or_renew(&request).await).is_ok()
        }
        LifecycleCommand::RegisterCheckout(request, reply) => {
            reply.send(coordinator.register_checkout(&request)).is_ok()
        }
        LifecycleCommand::GrantTrial(request, reply) => {
            reply.send(coordinator.grant_trial(&request).await).is_ok()
        }
        LifecycleCommand::GetStatus(identifier, reply) => {
            reply.send(coordinator.get_status(&identifier)).is_ok()
        }
        LifecycleCommand::ListByOwner(user_id, reply) => {
            reply.send(coordinator.list_by_owner(user_id)).is_ok()
        }
        LifecycleCommand::IssueAccessToken(identifier, reply) => {
            reply.send(coordinator.issue_access_token(&identifier)).is_ok()
        }
        LifecycleCommand::RedeemAccessToken(token, reply) => {
            reply.send(coordinator.redeem_access_token(&token)).is_ok()
        }
        LifecycleCommand::Revoke(public_key, reply) => {
            reply.send(coordinator.revoke(&public_key).await).is_ok()
        }
        LifecycleCommand::Sweep(reply) => reply.send(coordinator.sweep().await).is_ok(),
        LifecycleCommand::Reconcile(reply) => reply.send(coordinator.reconcile().await).is_ok(),
        LifecycleCommand::Status(reply) => reply.send(coordinator.status()).is_ok(),
    };

    if !delivered {
        // The work is done; only the caller stopped waiting
        warn!("Caller of {} went away before the reply", name);
    }
}

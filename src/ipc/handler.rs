//! IPC command handler
//!
//! This module maps IPC commands onto the lifecycle worker and turns the
//! results into responses.

use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::protocol::{ErrorCode, IpcCommand, IpcResponse, PlanInfo, ServerStatus};
use crate::error::LifecycleError;
use crate::lifecycle::LifecycleHandle;
use crate::peer::IpAllocatorError;
use crate::subscription::PLANS;

/// IPC command handler
pub struct IpcHandler {
    /// Front door to the lifecycle worker
    lifecycle: LifecycleHandle,

    /// Daemon-wide shutdown signal
    shutdown_tx: broadcast::Sender<()>,

    /// Server start time
    start_time: Instant,

    /// Server version
    version: String,
}

impl IpcHandler {
    /// Create a new IPC handler
    pub fn new(lifecycle: LifecycleHandle, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            lifecycle,
            shutdown_tx,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Handle an IPC command
    pub async fn handle(&self, command: IpcCommand) -> IpcResponse {
        debug!("Handling IPC command: {:?}", command);

        match command {
            IpcCommand::Ping => IpcResponse::Pong,

            IpcCommand::Status => self.handle_status().await,

            IpcCommand::ListPlans => IpcResponse::Plans {
                plans: PLANS.iter().map(PlanInfo::from).collect(),
            },

            IpcCommand::CreateOrRenew(request) => {
                respond(self.lifecycle.create_or_renew(request).await, IpcResponse::Provisioned)
            }

            IpcCommand::RegisterCheckout(request) => respond(
                self.lifecycle.register_checkout(request).await,
                |order_id| IpcResponse::CheckoutRegistered { order_id },
            ),

            IpcCommand::GrantTrial(request) => {
                respond(self.lifecycle.grant_trial(request).await, IpcResponse::Provisioned)
            }

            IpcCommand::GetStatus { identifier } => respond(
                self.lifecycle.get_status(identifier).await,
                IpcResponse::SubscriptionStatus,
            ),

            IpcCommand::ListByOwner { user_id } => respond(
                self.lifecycle.list_by_owner(user_id).await,
                |subscriptions| IpcResponse::OwnedSubscriptions { subscriptions },
            ),

            IpcCommand::IssueAccessToken { identifier } => respond(
                self.lifecycle.issue_access_token(identifier).await,
                IpcResponse::AccessToken,
            ),

            IpcCommand::RedeemAccessToken { token } => respond(
                self.lifecycle.redeem_access_token(token).await,
                IpcResponse::Config,
            ),

            IpcCommand::Revoke { public_key } => {
                respond(self.lifecycle.revoke(public_key).await, IpcResponse::Revoked)
            }

            IpcCommand::Reconcile => {
                respond(self.lifecycle.reconcile().await, IpcResponse::ReconcileResult)
            }

            IpcCommand::Sweep => respond(self.lifecycle.sweep().await, IpcResponse::SweepResult),

            IpcCommand::Shutdown => self.handle_shutdown(),
        }
    }

    /// Handle status command
    async fn handle_status(&self) -> IpcResponse {
        respond(self.lifecycle.status().await, |worker| {
            IpcResponse::Status(ServerStatus {
                version: self.version.clone(),
                uptime_secs: self.start_time.elapsed().as_secs(),
                worker,
            })
        })
    }

    /// Handle shutdown command
    fn handle_shutdown(&self) -> IpcResponse {
        info!("Shutdown requested over IPC");
        if self.shutdown_tx.send(()).is_err() {
            warn!("No task is listening for shutdown");
        }
        IpcResponse::success_with_message("Shutdown initiated")
    }
}

/// Map a lifecycle result onto a response
fn respond<T>(result: Result<T, LifecycleError>, ok: impl FnOnce(T) -> IpcResponse) -> IpcResponse {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            debug!("Lifecycle request failed: {}", e);
            IpcResponse::error(error_code(&e), e.to_string())
        }
    }
}

/// Error code reported for a lifecycle failure
pub fn error_code(error: &LifecycleError) -> ErrorCode {
    match error {
        LifecycleError::Validation(_) => ErrorCode::InvalidParameters,
        LifecycleError::Allocation(IpAllocatorError::Exhausted) => ErrorCode::PoolExhausted,
        LifecycleError::Allocation(_) => ErrorCode::OperationFailed,
        LifecycleError::NotFound(_) => ErrorCode::NotFound,
        LifecycleError::TrialAlreadyUsed { .. } => ErrorCode::AlreadyExists,
        LifecycleError::Transition(_) => ErrorCode::InvalidState,
        LifecycleError::TokenInvalid => ErrorCode::InvalidToken,
        LifecycleError::Control(_) | LifecycleError::Artifact { .. } => ErrorCode::OperationFailed,
        LifecycleError::Timeout { .. } => ErrorCode::Timeout,
        LifecycleError::WorkerUnavailable => ErrorCode::ShuttingDown,
        LifecycleError::Datastore(_) => ErrorCode::InternalError,
    }
}

//! Unix socket transport for the control surface
//!
//! [`IpcServer`] accepts connections and answers any number of framed
//! requests per connection, one response each. [`IpcClient`] is the
//! payment-processor and operator side: one connection per request, with
//! typed helpers that turn error responses into [`IpcError::Remote`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::handler::IpcHandler;
use super::protocol::{
    decode_message, encode_message, ErrorCode, IpcCommand, IpcResponse, PlanInfo, ServerStatus,
    LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
use crate::config::IpcConfig;
use crate::error::IpcError;
use crate::lifecycle::{
    IssuedToken, OwnedSubscription, PaymentConfirmation, ProvisionOutcome, ReconcileReport,
    RedeemedConfig, RevokeOutcome, SweepReport, TrialRequest,
};
use crate::subscription::SubscriptionState;

/// One inbound frame
enum Frame {
    /// Peer closed the connection between frames
    Closed,
    /// Declared length above the limit; the body was not read
    Oversized(usize),
    /// Complete body
    Body(Vec<u8>),
}

async fn read_frame(stream: &mut UnixStream, max_size: usize) -> Result<Frame, IpcError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    if let Err(e) = stream.read_exact(&mut len_buf).await {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Ok(Frame::Closed),
            _ => Err(e.into()),
        };
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Ok(Frame::Oversized(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Frame::Body(body))
}

async fn write_frame<T: serde::Serialize>(stream: &mut UnixStream, msg: &T) -> Result<(), IpcError> {
    let encoded = encode_message(msg).map_err(|e| IpcError::serialization(e.to_string()))?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

/// Removes the socket file when the server stops
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove IPC socket {:?}: {}", self.0, e);
            }
        }
    }
}

fn bind_listener(config: &IpcConfig) -> Result<(UnixListener, SocketFile), IpcError> {
    let path = &config.socket_path;
    let creation = |reason: String| IpcError::SocketCreation {
        path: path.display().to_string(),
        reason,
    };

    // A stale socket from an unclean exit blocks bind
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale IPC socket {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(creation(format!("cannot remove stale socket: {e}"))),
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| creation(format!("cannot create parent directory: {e}")))?;
    }

    let listener = UnixListener::bind(path).map_err(|e| IpcError::BindError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let guard = SocketFile(path.clone());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(config.socket_mode))
            .map_err(|e| creation(format!("cannot set mode {:o}: {e}", config.socket_mode)))?;
    }

    Ok((listener, guard))
}

/// Control-surface server
pub struct IpcServer {
    config: IpcConfig,
    handler: Arc<IpcHandler>,
    shutdown_tx: broadcast::Sender<()>,
}

impl IpcServer {
    /// Create a server that stops on `shutdown_tx`
    pub fn new(
        config: IpcConfig,
        handler: Arc<IpcHandler>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config,
            handler,
            shutdown_tx,
        }
    }

    /// Serve until the daemon-wide shutdown signal fires
    pub async fn run(&self) -> Result<(), IpcError> {
        if !self.config.enabled {
            info!("IPC server disabled");
            return Ok(());
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (listener, _socket) = bind_listener(&self.config)?;
        info!(
            "IPC server listening on {:?} (mode {:o})",
            self.config.socket_path, self.config.socket_mode
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = Arc::clone(&self.handler);
                        let max_size = self.config.max_message_size;
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler, max_size).await {
                                debug!("IPC connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("IPC accept failed: {}", e),
                },
                _ = shutdown_rx.recv() => {
                    info!("IPC server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    handler: Arc<IpcHandler>,
    max_size: usize,
) -> Result<(), IpcError> {
    loop {
        let body = match read_frame(&mut stream, max_size).await? {
            Frame::Closed => return Ok(()),
            Frame::Body(body) => body,
            Frame::Oversized(len) => {
                warn!("Rejecting {} byte IPC frame (limit {})", len, max_size);
                let response = IpcResponse::error(
                    ErrorCode::InvalidParameters,
                    format!("Message too large: {len} bytes"),
                );
                // The unread body leaves the stream unframed; close after replying
                return write_frame(&mut stream, &response).await;
            }
        };

        let command: IpcCommand = match decode_message(&body) {
            Ok(command) => command,
            Err(e) => {
                warn!("Undecodable IPC command: {}", e);
                let response =
                    IpcResponse::error(ErrorCode::InvalidCommand, format!("Invalid command: {e}"));
                write_frame(&mut stream, &response).await?;
                continue;
            }
        };

        let closing = matches!(command, IpcCommand::Shutdown);
        let response = handler.handle(command).await;
        if let IpcResponse::Error(err) = &response {
            if err.code == ErrorCode::Timeout {
                warn!("Lifecycle request timed out; outcome unknown to the client: {}", err.message);
            }
        }
        write_frame(&mut stream, &response).await?;

        if closing {
            return Ok(());
        }
    }
}

/// Client for the control socket
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Client for the socket at `socket_path`
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Send one command and return the raw response
    pub async fn send(&self, command: IpcCommand) -> Result<IpcResponse, IpcError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| IpcError::ConnectionError(format!("{:?}: {e}", self.socket_path)))?;
        write_frame(&mut stream, &command).await?;

        match read_frame(&mut stream, MAX_MESSAGE_SIZE).await? {
            Frame::Body(body) => decode_message(&body).map_err(|e| IpcError::protocol(e.to_string())),
            Frame::Oversized(len) => Err(IpcError::protocol(format!("Response too large: {len} bytes"))),
            Frame::Closed => Err(IpcError::ConnectionError(
                "server closed the connection without a response".into(),
            )),
        }
    }

    /// Whether the server answers
    pub async fn ping(&self) -> Result<bool, IpcError> {
        Ok(matches!(self.send(IpcCommand::Ping).await?, IpcResponse::Pong))
    }

    /// Daemon status and pool counters
    pub async fn status(&self) -> Result<ServerStatus, IpcError> {
        match self.send(IpcCommand::Status).await? {
            IpcResponse::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Purchasable plans
    pub async fn list_plans(&self) -> Result<Vec<PlanInfo>, IpcError> {
        match self.send(IpcCommand::ListPlans).await? {
            IpcResponse::Plans { plans } => Ok(plans),
            other => Err(unexpected(other)),
        }
    }

    /// Report a confirmed payment
    ///
    /// A [`ErrorCode::Timeout`] rejection means the outcome is unknown;
    /// call [`Self::get_status`] before reporting the payment again.
    pub async fn create_or_renew(
        &self,
        payment: PaymentConfirmation,
    ) -> Result<ProvisionOutcome, IpcError> {
        match self.send(IpcCommand::CreateOrRenew(payment)).await? {
            IpcResponse::Provisioned(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Record a checkout before payment
    pub async fn register_checkout(&self, checkout: PaymentConfirmation) -> Result<i64, IpcError> {
        match self.send(IpcCommand::RegisterCheckout(checkout)).await? {
            IpcResponse::CheckoutRegistered { order_id } => Ok(order_id),
            other => Err(unexpected(other)),
        }
    }

    /// Claim the free trial
    pub async fn grant_trial(&self, request: TrialRequest) -> Result<ProvisionOutcome, IpcError> {
        match self.send(IpcCommand::GrantTrial(request)).await? {
            IpcResponse::Provisioned(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Status and expiry for an identifier
    pub async fn get_status(&self, identifier: impl Into<String>) -> Result<SubscriptionState, IpcError> {
        let command = IpcCommand::GetStatus {
            identifier: identifier.into(),
        };
        match self.send(command).await? {
            IpcResponse::SubscriptionStatus(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    /// Subscriptions of an owning user
    pub async fn list_by_owner(&self, user_id: i64) -> Result<Vec<OwnedSubscription>, IpcError> {
        match self.send(IpcCommand::ListByOwner { user_id }).await? {
            IpcResponse::OwnedSubscriptions { subscriptions } => Ok(subscriptions),
            other => Err(unexpected(other)),
        }
    }

    /// New single-use access token
    pub async fn issue_access_token(&self, identifier: impl Into<String>) -> Result<IssuedToken, IpcError> {
        let command = IpcCommand::IssueAccessToken {
            identifier: identifier.into(),
        };
        match self.send(command).await? {
            IpcResponse::AccessToken(token) => Ok(token),
            other => Err(unexpected(other)),
        }
    }

    /// Exchange a token for the client config
    pub async fn redeem_access_token(&self, token: impl Into<String>) -> Result<RedeemedConfig, IpcError> {
        let command = IpcCommand::RedeemAccessToken {
            token: token.into(),
        };
        match self.send(command).await? {
            IpcResponse::Config(config) => Ok(config),
            other => Err(unexpected(other)),
        }
    }

    /// Revoke a peer
    pub async fn revoke(&self, public_key: impl Into<String>) -> Result<RevokeOutcome, IpcError> {
        let command = IpcCommand::Revoke {
            public_key: public_key.into(),
        };
        match self.send(command).await? {
            IpcResponse::Revoked(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Run a sweep now
    pub async fn sweep(&self) -> Result<SweepReport, IpcError> {
        match self.send(IpcCommand::Sweep).await? {
            IpcResponse::SweepResult(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    /// Run a reconciliation pass now
    pub async fn reconcile(&self) -> Result<ReconcileReport, IpcError> {
        match self.send(IpcCommand::Reconcile).await? {
            IpcResponse::ReconcileResult(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the daemon to stop
    pub async fn shutdown(&self) -> Result<(), IpcError> {
        match self.send(IpcCommand::Shutdown).await? {
            IpcResponse::Success { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Error for a response that does not answer the command
fn unexpected(response: IpcResponse) -> IpcError {
    match response {
        IpcResponse::Error(err) => IpcError::Remote {
            code: err.code,
            message: err.message,
        },
        other => IpcError::protocol(format!("unexpected response: {other:?}")),
    }
}

//! Lifecycle coordinator
//!
//! Orchestrates allocate → provision → persist → notify for every
//! paid-entry (new subscription, renewal, reactivation, free trial), plus
//! checkout registration, access tokens and administrative revoke.
//!
//! The coordinator is owned by the lifecycle worker and every operation
//! takes `&mut self`, so allocation, peer registration and row persistence
//! for one request complete before the next request starts.
//!
//! # Failure policy
//!
//! - Validation and allocation failures abort before any side effect.
//! - Keypair generation failure is fatal; the allocated address is released.
//! - A failed peer registration is logged and the row is still persisted as
//!   paid (`degraded` in the outcome). Reconciliation repairs it later.
//! - Datastore failures roll back the row write, release the address and
//!   undo the peer registration.
//! - Notification failures are logged by the delivery task only.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::notify::{dispatch, Notification, Notifier, ProvisionAction};
use crate::error::{LifecycleError, RepositoryError};
use crate::peer::conf::ConfigGenerator;
use crate::peer::ip_allocator::{ClientIpAllocator, IpAllocatorError};
use crate::peer::keys::{derive_public_key, generate_access_token};
use crate::peer::store::PeerStore;
use crate::subscription::clock::Clock;
use crate::subscription::model::{
    NewSubscription, Subscription, SubscriptionState, SubscriptionStatus, SubscriptionUpdate,
};
use crate::subscription::plan::{extend_expiry, Plan, TRIAL_PLAN, TRIAL_PLAN_ID};
use crate::subscription::repository::OrderRepository;
use crate::subscription::state_machine::validate_status_transition;
use crate::subscription::validation::{
    validate_identifier, validate_paid_plan, validate_token, validate_wg_key,
};

/// Confirmed payment for a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub identifier: String,
    pub plan_id: u32,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub messaging_id: Option<i64>,
}

impl PaymentConfirmation {
    /// Confirmation without owner information
    pub fn new(identifier: impl Into<String>, plan_id: u32) -> Self {
        Self {
            identifier: identifier.into(),
            plan_id,
            user_id: None,
            messaging_id: None,
        }
    }
}

/// Free-trial claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRequest {
    pub identifier: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub messaging_id: Option<i64>,
}

/// Result of a paid-entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionOutcome {
    pub order_id: i64,
    pub action: ProvisionAction,
    pub config_path: PathBuf,
    pub expires_at: DateTime<Utc>,
    pub public_key: String,
    pub client_address: Ipv4Addr,
    /// The live registration failed; the row is paid but the peer is missing
    pub degraded: bool,
}

/// Freshly issued access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub order_id: i64,
    pub token: String,
}

/// Config handed out for a redeemed token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemedConfig {
    pub order_id: i64,
    pub config_path: PathBuf,
    pub config_text: String,
}

/// Result of an administrative revoke
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeOutcome {
    pub order_id: i64,
    pub released_address: Option<Ipv4Addr>,
}

/// Snapshot for the `status` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub backend: String,
    pub subnet: String,
    pub allocated_addresses: usize,
    pub available_addresses: usize,
    pub pending: u64,
    pub paid: u64,
    pub expired: u64,
}

/// One row in an owner's subscription listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedSubscription {
    pub order_id: i64,
    pub identifier: String,
    pub plan_label: String,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// The config artifact is recorded and still on disk
    pub has_config: bool,
}

/// Owner columns carried by a request
#[derive(Debug, Clone, Copy, Default)]
struct Owner {
    user_id: Option<i64>,
    messaging_id: Option<i64>,
}

/// Peer identity recovered from an existing row and its artifact
struct StoredIdentity {
    config_path: PathBuf,
    public_key: String,
    address: Ipv4Addr,
}

/// Orchestrates subscription lifecycle use-cases
pub struct LifecycleCoordinator {
    pub(super) repo: OrderRepository,
    pub(super) peers: PeerStore,
    pub(super) generator: ConfigGenerator,
    pub(super) allocator: ClientIpAllocator,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) notifier: Arc<dyn Notifier>,
}

impl LifecycleCoordinator {
    /// Create a coordinator; call [`Self::seed_allocator`] before serving requests
    pub fn new(
        repo: OrderRepository,
        peers: PeerStore,
        generator: ConfigGenerator,
        allocator: ClientIpAllocator,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            repo,
            peers,
            generator,
            allocator,
            clock,
            notifier,
        }
    }

    /// Mark every address already in use
    ///
    /// The usage set is the union of the peer-config file and the addresses
    /// recorded on subscription rows.
    pub fn seed_allocator(&mut self) -> Result<usize, LifecycleError> {
        let mut used = self.peers.used_addresses()?;
        used.extend(self.repo.assigned_addresses()?);
        let marked = self.allocator.seed(used);
        info!(
            "Address pool {} seeded: {} in use, {} free",
            self.allocator.subnet(),
            self.allocator.allocated_count(),
            self.allocator.available_count()
        );
        Ok(marked)
    }

    /// The address allocator
    #[must_use]
    pub fn allocator(&self) -> &ClientIpAllocator {
        &self.allocator
    }

    /// Turn a confirmed payment into (or extend) a paid subscription
    ///
    /// The most recent paid or expired row for the identifier is extended;
    /// failing that, the most recent pending checkout is promoted; failing
    /// that, a new row is created.
    pub async fn create_or_renew(
        &mut self,
        request: &PaymentConfirmation,
    ) -> Result<ProvisionOutcome, LifecycleError> {
        let identifier = validate_identifier(&request.identifier)?.to_string();
        let plan = validate_paid_plan(request.plan_id)?;

        let existing = self.repo.transaction(|tx| -> Result<_, RepositoryError> {
            match tx.find_active_by_identifier(&identifier)? {
                Some(row) => Ok(Some(row)),
                None => tx.find_latest_pending(&identifier),
            }
        })?;

        let owner = Owner {
            user_id: request.user_id,
            messaging_id: request.messaging_id,
        };
        self.enter_paid(&identifier, plan, existing, owner).await
    }

    /// Grant the free trial to an identifier that never had access
    pub async fn grant_trial(
        &mut self,
        request: &TrialRequest,
    ) -> Result<ProvisionOutcome, LifecycleError> {
        let identifier = validate_identifier(&request.identifier)?.to_string();

        let (trial_used, active) = self.repo.transaction(|tx| -> Result<_, RepositoryError> {
            Ok((
                tx.has_plan_history(&identifier, TRIAL_PLAN_ID)?,
                tx.find_active_by_identifier(&identifier)?,
            ))
        })?;
        if trial_used || active.is_some() {
            return Err(LifecycleError::TrialAlreadyUsed { identifier });
        }

        let owner = Owner {
            user_id: request.user_id,
            messaging_id: request.messaging_id,
        };
        self.enter_paid(&identifier, &TRIAL_PLAN, None, owner).await
    }

    /// Record a checkout intent before payment confirmation
    pub fn register_checkout(&mut self, request: &PaymentConfirmation) -> Result<i64, LifecycleError> {
        let identifier = validate_identifier(&request.identifier)?;
        let plan = validate_paid_plan(request.plan_id)?;

        let order_id = self.repo.transaction(|tx| {
            tx.insert(&NewSubscription {
                identifier: identifier.to_string(),
                plan_id: plan.id,
                plan_label: plan.label.to_string(),
                price: plan.price,
                status: SubscriptionStatus::Pending,
                created_at: self.clock.now(),
                expires_at: None,
                user_id: request.user_id,
                messaging_id: request.messaging_id,
            })
        })?;
        info!(order_id, plan = plan.label, "Checkout registered for {}", identifier);
        Ok(order_id)
    }

    /// Status and expiry of the identifier's current subscription
    pub fn get_status(&self, identifier: &str) -> Result<SubscriptionState, LifecycleError> {
        let identifier = validate_identifier(identifier)?;
        let row = self.repo.transaction(|tx| -> Result<_, RepositoryError> {
            match tx.find_active_by_identifier(identifier)? {
                Some(row) => Ok(Some(row)),
                None => tx.find_latest_pending(identifier),
            }
        })?;

        row.map(|row| SubscriptionState {
            status: row.status,
            expires_at: row.expires_at,
        })
        .ok_or_else(|| LifecycleError::NotFound(format!("no subscription for {identifier}")))
    }

    /// Store a new single-use token on the identifier's paid subscription
    pub fn issue_access_token(&mut self, identifier: &str) -> Result<IssuedToken, LifecycleError> {
        let identifier = validate_identifier(identifier)?;
        let token = generate_access_token();

        let order_id = self.repo.transaction(|tx| -> Result<i64, LifecycleError> {
            let row = tx
                .find_active_by_identifier(identifier)?
                .filter(|row| row.status == SubscriptionStatus::Paid)
                .ok_or_else(|| {
                    LifecycleError::NotFound(format!("no paid subscription for {identifier}"))
                })?;
            tx.update_fields(
                row.id,
                &SubscriptionUpdate {
                    access_token: Some(Some(token.clone())),
                    ..Default::default()
                },
            )?;
            Ok(row.id)
        })?;

        debug!(order_id, "Access token issued");
        Ok(IssuedToken { order_id, token })
    }

    /// Exchange a token for the config artifact; the token is cleared in the same transaction
    pub fn redeem_access_token(&mut self, token: &str) -> Result<RedeemedConfig, LifecycleError> {
        let token = validate_token(token)?;

        let redeemed = self.repo.transaction(|tx| -> Result<RedeemedConfig, LifecycleError> {
            let row = tx
                .find_by_access_token(token)?
                .ok_or(LifecycleError::TokenInvalid)?;
            tx.update_fields(
                row.id,
                &SubscriptionUpdate {
                    access_token: Some(None),
                    ..Default::default()
                },
            )?;

            let config_path = row.config_path.ok_or_else(|| {
                LifecycleError::NotFound(format!("subscription {} has no config", row.id))
            })?;
            let config_text = std::fs::read_to_string(&config_path)
                .map_err(|e| LifecycleError::artifact(&config_path, e))?;
            Ok(RedeemedConfig {
                order_id: row.id,
                config_path,
                config_text,
            })
        })?;

        info!(order_id = redeemed.order_id, "Access token redeemed");
        Ok(redeemed)
    }

    /// Administratively revoke a peer
    ///
    /// Removes the live peer and its block in the peer-config file, deletes
    /// the artifact, expires the row and returns its address to the pool.
    pub async fn revoke(&mut self, public_key: &str) -> Result<RevokeOutcome, LifecycleError> {
        validate_wg_key(public_key)?;

        let row = self
            .repo
            .transaction(|tx| tx.find_by_public_key(public_key))?
            .ok_or_else(|| LifecycleError::NotFound(format!("no subscription with key {public_key}")))?;
        validate_status_transition(row.status, SubscriptionStatus::Expired)?;

        if let Err(e) = self.peers.remove_peer(public_key).await {
            warn!(order_id = row.id, "Failed to remove peer {}: {}", public_key, e);
        }
        if let Err(e) = self.peers.forget(public_key) {
            warn!(order_id = row.id, "Failed to prune peer {}: {}", public_key, e);
        }
        if let Some(path) = &row.config_path {
            if let Err(e) = ConfigGenerator::remove_artifact(path) {
                warn!(order_id = row.id, "Failed to delete {:?}: {}", path, e);
            }
        }

        self.repo.transaction(|tx| {
            tx.update_fields(
                row.id,
                &SubscriptionUpdate {
                    status: Some(SubscriptionStatus::Expired),
                    config_path: Some(None),
                    client_address: Some(None),
                    access_token: Some(None),
                    ..Default::default()
                },
            )
        })?;

        let released_address = row
            .client_address
            .filter(|address| self.allocator.release(*address));
        info!(order_id = row.id, address = ?released_address, "Revoked peer {}", public_key);

        Ok(RevokeOutcome {
            order_id: row.id,
            released_address,
        })
    }

    /// Every subscription recorded for an owning user, newest first
    pub fn list_by_owner(&self, user_id: i64) -> Result<Vec<OwnedSubscription>, LifecycleError> {
        let rows = self.repo.list_by_owner(user_id)?;
        Ok(rows
            .into_iter()
            .map(|row| OwnedSubscription {
                has_config: row.config_path.as_deref().is_some_and(|path| path.exists()),
                order_id: row.id,
                identifier: row.identifier,
                plan_label: row.plan_label,
                status: row.status,
                created_at: row.created_at,
                expires_at: row.expires_at,
            })
            .collect())
    }

    /// Counters for the `status` command
    pub fn status(&self) -> Result<WorkerStatus, LifecycleError> {
        Ok(WorkerStatus {
            backend: self.peers.backend().to_string(),
            subnet: self.allocator.subnet(),
            allocated_addresses: self.allocator.allocated_count(),
            available_addresses: self.allocator.available_count(),
            pending: self.repo.count_by_status(SubscriptionStatus::Pending)?,
            paid: self.repo.count_by_status(SubscriptionStatus::Paid)?,
            expired: self.repo.count_by_status(SubscriptionStatus::Expired)?,
        })
    }

    // ========================================================================
    // Paid-entry
    // ========================================================================

    async fn enter_paid(
        &mut self,
        identifier: &str,
        plan: &Plan,
        existing: Option<Subscription>,
        owner: Owner,
    ) -> Result<ProvisionOutcome, LifecycleError> {
        if let Some(row) = &existing {
            validate_status_transition(row.status, SubscriptionStatus::Paid)?;
        }
        let expires_at = extend_expiry(
            existing.as_ref().and_then(|row| row.expires_at),
            self.clock.now(),
            plan.duration,
        );

        let outcome = match existing {
            Some(row) => match self.stored_identity(&row) {
                Some(identity) => {
                    self.extend_existing(row, plan, expires_at, identity, owner)
                        .await?
                }
                None => {
                    self.provision_fresh(identifier, plan, expires_at, Some(row), owner)
                        .await?
                }
            },
            None => {
                self.provision_fresh(identifier, plan, expires_at, None, owner)
                    .await?
            }
        };

        dispatch(
            Arc::clone(&self.notifier),
            Notification {
                order_id: outcome.order_id,
                identifier: identifier.to_string(),
                config_path: outcome.config_path.clone(),
                expires_at: Some(outcome.expires_at),
                action: outcome.action,
                messaging_id: owner.messaging_id,
            },
        );

        Ok(outcome)
    }

    /// Recover the key and address of a row whose artifact still exists
    fn stored_identity(&mut self, row: &Subscription) -> Option<StoredIdentity> {
        let config_path = row.config_path.clone()?;
        let Some((_, parsed)) = ConfigGenerator::read_artifact(&config_path) else {
            warn!(order_id = row.id, "Config {:?} is missing; provisioning a new peer", config_path);
            return None;
        };

        let public_key = match (&row.public_key, &parsed.private_key) {
            (Some(key), _) => key.clone(),
            (None, Some(private_key)) => match derive_public_key(private_key) {
                Ok(key) => key,
                Err(e) => {
                    warn!(order_id = row.id, "Cannot derive public key from {:?}: {}", config_path, e);
                    return None;
                }
            },
            (None, None) => return None,
        };

        let address = match (row.client_address, parsed.address) {
            (Some(address), _) => {
                // Recorded on the row, so it was seeded as used
                self.allocator.seed([address]);
                address
            }
            (None, Some(address)) => match self.allocator.allocate_specific(address) {
                Ok(()) => address,
                Err(IpAllocatorError::AlreadyAllocated(_)) if self.peers_file_owns(&public_key) => {
                    address
                }
                Err(e) => {
                    warn!(order_id = row.id, "Stored address unusable: {}", e);
                    return None;
                }
            },
            (None, None) => return None,
        };

        Some(StoredIdentity {
            config_path,
            public_key,
            address,
        })
    }

    /// Whether the peer-config file already holds a block for this key
    fn peers_file_owns(&self, public_key: &str) -> bool {
        self.peers.block_count(public_key).unwrap_or(0) > 0
    }

    /// Renewal or reactivation that keeps the stored identity
    async fn extend_existing(
        &mut self,
        row: Subscription,
        plan: &Plan,
        expires_at: DateTime<Utc>,
        identity: StoredIdentity,
        owner: Owner,
    ) -> Result<ProvisionOutcome, LifecycleError> {
        let (action, degraded) = if row.status == SubscriptionStatus::Paid {
            (ProvisionAction::Renewed, false)
        } else {
            let registered = self
                .register_peer(&identity.public_key, identity.address, row.id)
                .await;
            (ProvisionAction::Reactivated, !registered)
        };

        let update = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Paid),
            plan_id: Some(plan.id),
            plan_label: Some(plan.label.to_string()),
            price: Some(plan.price),
            expires_at: Some(Some(expires_at)),
            public_key: row
                .public_key
                .is_none()
                .then(|| Some(identity.public_key.clone())),
            client_address: row
                .client_address
                .is_none()
                .then_some(Some(identity.address)),
            user_id: fill_missing(row.user_id, owner.user_id),
            messaging_id: fill_missing(row.messaging_id, owner.messaging_id),
            ..Default::default()
        };
        self.repo.transaction(|tx| tx.update_fields(row.id, &update))?;

        info!(
            order_id = row.id,
            action = ?action,
            address = %identity.address,
            expires_at = %expires_at,
            "Subscription extended"
        );

        Ok(ProvisionOutcome {
            order_id: row.id,
            action,
            config_path: identity.config_path,
            expires_at,
            public_key: identity.public_key,
            client_address: identity.address,
            degraded,
        })
    }

    /// Allocate, generate, register, then persist row and artifact in one transaction
    async fn provision_fresh(
        &mut self,
        identifier: &str,
        plan: &Plan,
        expires_at: DateTime<Utc>,
        existing: Option<Subscription>,
        owner: Owner,
    ) -> Result<ProvisionOutcome, LifecycleError> {
        let address = self.allocator.allocate()?;
        let pair = match self.peers.generate_keypair().await {
            Ok(pair) => pair,
            Err(e) => {
                self.allocator.release(address);
                return Err(e.into());
            }
        };

        let log_id = existing.as_ref().map_or(0, |row| row.id);
        let registered = self.register_peer(&pair.public_key, address, log_id).await;
        let now = self.clock.now();

        let persisted = self.repo.transaction(|tx| -> Result<(i64, PathBuf), LifecycleError> {
            let order_id = match &existing {
                Some(row) => row.id,
                None => tx.insert(&NewSubscription {
                    identifier: identifier.to_string(),
                    plan_id: plan.id,
                    plan_label: plan.label.to_string(),
                    price: plan.price,
                    status: SubscriptionStatus::Paid,
                    created_at: now,
                    expires_at: Some(expires_at),
                    user_id: owner.user_id,
                    messaging_id: owner.messaging_id,
                })?,
            };

            let text = self
                .generator
                .render(identifier, plan.label, address, &pair.private_key);
            let config_path = self
                .generator
                .write_to_storage(order_id, &text)
                .map_err(|e| LifecycleError::artifact(self.generator.artifact_path(order_id), e))?;

            let mut update = SubscriptionUpdate {
                config_path: Some(Some(config_path.clone())),
                public_key: Some(Some(pair.public_key.clone())),
                client_address: Some(Some(address)),
                ..Default::default()
            };
            if let Some(row) = &existing {
                update.status = Some(SubscriptionStatus::Paid);
                update.plan_id = Some(plan.id);
                update.plan_label = Some(plan.label.to_string());
                update.price = Some(plan.price);
                update.expires_at = Some(Some(expires_at));
                update.user_id = fill_missing(row.user_id, owner.user_id);
                update.messaging_id = fill_missing(row.messaging_id, owner.messaging_id);
            }
            tx.update_fields(order_id, &update)?;
            Ok((order_id, config_path))
        });

        let (order_id, config_path) = match persisted {
            Ok(persisted) => persisted,
            Err(e) => {
                self.allocator.release(address);
                if registered {
                    self.discard_peer(&pair.public_key).await;
                }
                return Err(e);
            }
        };

        // A row that lost its artifact may still carry the old identity
        let action = match &existing {
            Some(row) if row.status != SubscriptionStatus::Pending => {
                self.retire_identity(row, &pair.public_key, address).await;
                ProvisionAction::Reprovisioned
            }
            _ => ProvisionAction::Created,
        };

        info!(
            order_id,
            action = ?action,
            address = %address,
            expires_at = %expires_at,
            "Provisioned peer {} for {}",
            pair.public_key,
            identifier
        );

        Ok(ProvisionOutcome {
            order_id,
            action,
            config_path,
            expires_at,
            public_key: pair.public_key,
            client_address: address,
            degraded: !registered,
        })
    }

    /// Register a peer; failures are logged and reported as `false`
    async fn register_peer(&self, public_key: &str, address: Ipv4Addr, order_id: i64) -> bool {
        match self.peers.add_peer(public_key, address).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    order_id,
                    %address,
                    "Peer registration failed, subscription stays paid until reconciled: {}",
                    e
                );
                false
            }
        }
    }

    /// Best-effort removal of a peer that never made it into the datastore
    async fn discard_peer(&self, public_key: &str) {
        if let Err(e) = self.peers.remove_peer(public_key).await {
            warn!("Failed to roll back peer {}: {}", public_key, e);
        }
        if let Err(e) = self.peers.forget(public_key) {
            warn!("Failed to prune peer {}: {}", public_key, e);
        }
    }

    /// Drop the previous key and address of a re-provisioned row
    async fn retire_identity(&mut self, row: &Subscription, new_key: &str, new_address: Ipv4Addr) {
        if let Some(old_key) = row.public_key.as_deref().filter(|key| *key != new_key) {
            self.discard_peer(old_key).await;
        }
        if let Some(old_address) = row.client_address.filter(|addr| *addr != new_address) {
            self.allocator.release(old_address);
        }
    }
}

/// Update value that only fills a column when it is still empty
fn fill_missing(current: Option<i64>, incoming: Option<i64>) -> Option<Option<i64>> {
    match (current, incoming) {
        (None, Some(value)) => Some(Some(value)),
        _ => None,
    }
}

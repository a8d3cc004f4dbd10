//! Reconciliation of subscription rows against live peers
//!
//! Peer registration and row persistence are not atomic with respect to
//! each other, so a tool failure can leave a paid row without a live peer
//! or an expired row whose peer is still up. This pass converges the two
//! sets and is safe to run any number of times.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::coordinator::LifecycleCoordinator;
use crate::error::{LifecycleError, RepositoryError};
use crate::subscription::model::SubscriptionStatus;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Peers on the live interface before the pass
    pub live_peers: usize,
    /// Paid rows inspected
    pub paid: usize,
    /// Paid rows whose peer was registered again
    pub reprovisioned: Vec<i64>,
    /// Stale peers removed from the interface
    pub removed: Vec<String>,
    /// Live peers unknown to the datastore, left in place
    pub foreign: usize,
    /// Paid rows with no key or address to register
    pub unprovisioned: Vec<i64>,
    /// Peer operations that failed
    pub failures: usize,
}

impl LifecycleCoordinator {
    /// Converge live peers with paid subscription rows
    pub async fn reconcile(&mut self) -> Result<ReconcileReport, LifecycleError> {
        let live = self.peers.live_peers().await?;
        let paid_rows = self.repo.list_paid()?;

        let mut report = ReconcileReport {
            live_peers: live.len(),
            paid: paid_rows.len(),
            ..ReconcileReport::default()
        };

        let mut paid_keys = HashSet::with_capacity(paid_rows.len());
        for row in &paid_rows {
            let Some((public_key, address)) = row.peer_identity() else {
                warn!(order_id = row.id, "Paid subscription has no peer identity");
                report.unprovisioned.push(row.id);
                continue;
            };
            paid_keys.insert(public_key.to_string());
            if live.contains(public_key) {
                continue;
            }

            // Keep the allocator authoritative for the re-registered address
            self.allocator.seed([address]);
            match self.peers.add_peer(public_key, address).await {
                Ok(()) => {
                    info!(order_id = row.id, %address, "Re-registered missing peer");
                    report.reprovisioned.push(row.id);
                }
                Err(e) => {
                    warn!(order_id = row.id, "Failed to re-register peer: {}", e);
                    report.failures += 1;
                }
            }
        }

        for key in live.iter().filter(|key| !paid_keys.contains(*key)) {
            let owner = self
                .repo
                .transaction(|tx| -> Result<_, RepositoryError> { tx.find_by_public_key(key) })?;
            match owner {
                Some(row) if row.status != SubscriptionStatus::Paid => {
                    match self.peers.remove_peer(key).await {
                        Ok(()) => {
                            info!(order_id = row.id, status = %row.status, "Removed stale peer {}", key);
                            report.removed.push(key.clone());
                        }
                        Err(e) => {
                            warn!(order_id = row.id, "Failed to remove stale peer {}: {}", key, e);
                            report.failures += 1;
                        }
                    }
                }
                Some(_) => {}
                None => report.foreign += 1,
            }
        }

        info!(
            "Reconciliation: {} live, {} paid, {} re-registered, {} removed, {} foreign",
            report.live_peers,
            report.paid,
            report.reprovisioned.len(),
            report.removed.len(),
            report.foreign
        );
        Ok(report)
    }
}

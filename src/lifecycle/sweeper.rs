//! Expiry sweeper
//!
//! A background task that submits a sweep to the lifecycle worker on a
//! fixed interval, and a reconciliation pass every `reconcile_every` ticks.
//! A failed tick is logged and the loop waits for the next one.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::coordinator::LifecycleCoordinator;
use super::worker::LifecycleHandle;
use crate::config::SweeperConfig;
use crate::error::LifecycleError;

/// Outcome of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Lapsed paid rows found
    pub checked: usize,
    /// Rows moved to expired
    pub expired: Vec<i64>,
    /// Peer removals that failed (the row is expired regardless)
    pub remove_failures: usize,
    /// Rows whose status update failed; retried next tick
    pub errors: usize,
}

impl LifecycleCoordinator {
    /// Expire every paid subscription whose window has ended
    ///
    /// Each lapsed row gets one peer removal followed by the status change.
    /// Rows without an expiry never lapse. The address and artifact stay
    /// with the row so a later renewal can reactivate the same identity.
    pub async fn sweep(&mut self) -> Result<SweepReport, LifecycleError> {
        let now = self.clock.now();
        let lapsed: Vec<_> = self
            .repo
            .list_paid_with_expiry()?
            .into_iter()
            .filter(|row| row.is_lapsed(now))
            .collect();

        let mut report = SweepReport {
            checked: lapsed.len(),
            ..SweepReport::default()
        };

        for row in lapsed {
            if let Some(public_key) = row.public_key.as_deref() {
                if let Err(e) = self.peers.remove_peer(public_key).await {
                    warn!(order_id = row.id, "Failed to remove lapsed peer {}: {}", public_key, e);
                    report.remove_failures += 1;
                }
            }

            match self.repo.mark_expired(row.id) {
                Ok(true) => {
                    info!(
                        order_id = row.id,
                        identifier = %row.identifier,
                        "Subscription expired"
                    );
                    report.expired.push(row.id);
                }
                Ok(false) => debug!(order_id = row.id, "Row left paid state before sweep"),
                Err(e) => {
                    warn!(order_id = row.id, "Failed to mark subscription expired: {}", e);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Periodic driver for sweeps and reconciliation
pub struct ExpirySweeper {
    handle: LifecycleHandle,
    interval: Duration,
    reconcile_every: u32,
}

impl ExpirySweeper {
    /// Create a sweeper that submits work through `handle`
    pub fn new(handle: LifecycleHandle, config: &SweeperConfig) -> Self {
        Self {
            handle,
            interval: config.interval(),
            reconcile_every: config.reconcile_every,
        }
    }

    /// Spawn the sweep loop
    pub fn spawn(self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the first immediate tick
        timer.tick().await;

        info!(
            "Expiry sweeper started (interval: {:?}, reconcile every {} ticks)",
            self.interval, self.reconcile_every
        );

        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    ticks += 1;
                    self.tick(ticks).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Expiry sweeper shutdown signal received");
                    break;
                }
            }
        }
    }

    async fn tick(&self, ticks: u64) {
        match self.handle.sweep().await {
            Ok(report) if report.checked > 0 => info!(
                "Sweep expired {} of {} lapsed subscriptions ({} peer removals failed)",
                report.expired.len(),
                report.checked,
                report.remove_failures
            ),
            Ok(_) => debug!("Sweep found nothing to expire"),
            Err(e) => warn!("Sweep failed: {}", e),
        }

        if self.reconcile_every > 0 && ticks % u64::from(self.reconcile_every) == 0 {
            match self.handle.reconcile().await {
                Ok(report) => debug!(?report, "Periodic reconciliation finished"),
                Err(e) => warn!("Reconciliation failed: {}", e),
            }
        }
    }
}

//! Expiry sweep and reconciliation tests

use std::net::Ipv4Addr;
use std::time::Duration as StdDuration;

use chrono::Duration;

use wg_provisioner::config::SweeperConfig;
use wg_provisioner::lifecycle::{ExpirySweeper, PaymentConfirmation};
use wg_provisioner::subscription::{NewSubscription, SubscriptionStatus};

use super::{t0, Harness};

/// A paid row with no expiry, inserted directly
fn perpetual_row(harness: &Harness, identifier: &str) -> i64 {
    harness
        .repo
        .insert(&NewSubscription {
            identifier: identifier.to_string(),
            plan_id: 1,
            plan_label: "legacy".into(),
            price: 1.0,
            status: SubscriptionStatus::Paid,
            created_at: t0(),
            expires_at: None,
            user_id: None,
            messaging_id: None,
        })
        .unwrap()
}

#[tokio::test]
async fn test_sweep_expires_only_lapsed_rows() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let lapsing = coordinator
        .create_or_renew(&PaymentConfirmation::new("a@x.com", 1))
        .await
        .unwrap();
    let lasting = coordinator
        .create_or_renew(&PaymentConfirmation::new("b@x.com", 3))
        .await
        .unwrap();
    let perpetual = perpetual_row(&harness, "c@x.com");

    harness.clock.advance(Duration::days(32));
    let removes_before = harness.control.remove_calls();
    let report = coordinator.sweep().await.unwrap();

    assert_eq!(report.checked, 1);
    assert_eq!(report.expired, vec![lapsing.order_id]);
    assert_eq!(harness.control.remove_calls() - removes_before, 1);
    assert!(!harness.control.has_peer(&lapsing.public_key));
    assert!(harness.control.has_peer(&lasting.public_key));

    let status = |id| harness.repo.get(id).unwrap().unwrap().status;
    assert_eq!(status(lapsing.order_id), SubscriptionStatus::Expired);
    assert_eq!(status(lasting.order_id), SubscriptionStatus::Paid);
    assert_eq!(status(perpetual), SubscriptionStatus::Paid);

    // The expired row keeps its identity for a later reactivation
    let row = harness.repo.get(lapsing.order_id).unwrap().unwrap();
    assert_eq!(row.client_address, Some(lapsing.client_address));
    assert!(lapsing.config_path.exists());
    assert!(coordinator.allocator().is_allocated(lapsing.client_address));
}

#[tokio::test]
async fn test_sweep_is_idempotent() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    coordinator
        .create_or_renew(&PaymentConfirmation::new("a@x.com", 1))
        .await
        .unwrap();
    harness.clock.advance(Duration::days(40));

    let first = coordinator.sweep().await.unwrap();
    let second = coordinator.sweep().await.unwrap();

    assert_eq!(first.expired.len(), 1);
    assert_eq!(second.checked, 0);
    assert_eq!(harness.control.remove_calls(), 1);
}

#[tokio::test]
async fn test_sweep_before_expiry_does_nothing() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    coordinator
        .create_or_renew(&PaymentConfirmation::new("a@x.com", 1))
        .await
        .unwrap();
    harness.clock.advance(Duration::days(30));

    let report = coordinator.sweep().await.unwrap();
    assert_eq!(report.checked, 0);
    assert!(report.expired.is_empty());
    assert_eq!(harness.control.remove_calls(), 0);
}

#[tokio::test]
async fn test_pending_rows_are_never_swept() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let order_id = coordinator
        .register_checkout(&PaymentConfirmation::new("a@x.com", 1))
        .unwrap();
    harness.clock.advance(Duration::days(400));

    let report = coordinator.sweep().await.unwrap();
    assert_eq!(report.checked, 0);
    assert_eq!(
        harness.repo.get(order_id).unwrap().unwrap().status,
        SubscriptionStatus::Pending
    );
}

#[tokio::test]
async fn test_sweeper_task_runs_on_interval() {
    let harness = Harness::new();
    let (handle, worker, shutdown_tx) = harness.spawn();

    let outcome = handle
        .create_or_renew(PaymentConfirmation::new("a@x.com", 1))
        .await
        .unwrap();
    harness.clock.advance(Duration::days(40));

    let config = SweeperConfig {
        enabled: true,
        interval_secs: 1,
        reconcile_every: 0,
    };
    let sweeper = ExpirySweeper::new(handle.clone(), &config).spawn(shutdown_tx.subscribe());

    let mut expired = false;
    for _ in 0..40 {
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        let state = handle.get_status("a@x.com").await.unwrap();
        if state.status == SubscriptionStatus::Expired {
            expired = true;
            break;
        }
    }
    assert!(expired, "sweeper did not expire the subscription");
    assert!(!harness.control.has_peer(&outcome.public_key));

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(StdDuration::from_secs(2), sweeper)
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(StdDuration::from_secs(2), worker)
        .await
        .unwrap()
        .unwrap();
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn test_reconcile_registers_degraded_peer() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    harness.control.set_fail_add(true);
    let outcome = coordinator
        .create_or_renew(&PaymentConfirmation::new("a@x.com", 1))
        .await
        .unwrap();
    assert!(outcome.degraded);

    harness.control.set_fail_add(false);
    let report = coordinator.reconcile().await.unwrap();

    assert_eq!(report.reprovisioned, vec![outcome.order_id]);
    assert!(harness.control.has_peer(&outcome.public_key));
    assert_eq!(harness.peer_blocks(&outcome.public_key), 1);

    // A second pass finds nothing to do
    let again = coordinator.reconcile().await.unwrap();
    assert!(again.reprovisioned.is_empty());
    assert!(again.removed.is_empty());
}

#[tokio::test]
async fn test_reconcile_removes_stale_peer_and_keeps_foreign() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let outcome = coordinator
        .create_or_renew(&PaymentConfirmation::new("a@x.com", 1))
        .await
        .unwrap();
    harness.clock.advance(Duration::days(40));
    coordinator.sweep().await.unwrap();

    // The removal was lost: the peer is back on the interface
    harness
        .control
        .insert_peer(outcome.public_key.clone(), outcome.client_address);
    let operator_key = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";
    harness
        .control
        .insert_peer(operator_key, Ipv4Addr::new(10, 0, 0, 200));

    let report = coordinator.reconcile().await.unwrap();

    assert_eq!(report.live_peers, 2);
    assert_eq!(report.removed, vec![outcome.public_key.clone()]);
    assert_eq!(report.foreign, 1);
    assert!(!harness.control.has_peer(&outcome.public_key));
    assert!(harness.control.has_peer(operator_key));
}

#[tokio::test]
async fn test_reconcile_reports_unprovisioned_rows() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();
    let order_id = perpetual_row(&harness, "legacy@x.com");

    let report = coordinator.reconcile().await.unwrap();
    assert_eq!(report.paid, 1);
    assert_eq!(report.unprovisioned, vec![order_id]);
    assert_eq!(report.failures, 0);
}

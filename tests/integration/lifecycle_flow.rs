//! Lifecycle integration tests
//!
//! Paid-entry for new identifiers, renewal stacking, reactivation with
//! identity continuity, validation, pool exhaustion, trials, access tokens,
//! administrative revoke, owner listing and worker serialization.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};

use wg_provisioner::config::LifecycleConfig;
use wg_provisioner::error::LifecycleError;
use wg_provisioner::lifecycle::{PaymentConfirmation, ProvisionAction, TrialRequest};
use wg_provisioner::peer::{derive_public_key, parse_client_config, IpAllocatorError};
use wg_provisioner::subscription::{Clock, SubscriptionStatus, ValidationError, TRIAL_PLAN_ID};

use super::{settle, t0, Harness};

fn pay(identifier: &str, plan_id: u32) -> PaymentConfirmation {
    PaymentConfirmation::new(identifier, plan_id)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_new_subscription_is_provisioned() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let outcome = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();

    assert_eq!(outcome.action, ProvisionAction::Created);
    assert!(!outcome.degraded);
    assert_eq!(outcome.expires_at, Utc.with_ymd_and_hms(2026, 2, 15, 12, 0, 0).unwrap());
    assert_eq!(outcome.client_address, Ipv4Addr::new(10, 0, 0, 1));

    let row = harness.repo.get(outcome.order_id).unwrap().unwrap();
    assert_eq!(row.status, SubscriptionStatus::Paid);
    assert_eq!(row.expires_at, Some(outcome.expires_at));
    assert_eq!(row.plan_id, 1);
    assert_eq!(row.price, 99.0);
    assert_eq!(row.public_key.as_deref(), Some(outcome.public_key.as_str()));
    assert_eq!(row.client_address, Some(outcome.client_address));
    assert_eq!(row.config_path.as_deref(), Some(outcome.config_path.as_path()));

    // The artifact parses back to the same identity
    let text = std::fs::read_to_string(&outcome.config_path).unwrap();
    assert!(text.contains("# Identity: a@x.com\n# Plan: 1 month\n"));
    let parsed = parse_client_config(&text);
    assert_eq!(parsed.address, Some(outcome.client_address));
    let private_key = parsed.private_key.unwrap();
    assert_eq!(derive_public_key(&private_key).unwrap(), outcome.public_key);

    assert!(harness.control.has_peer(&outcome.public_key));
    assert_eq!(harness.peer_blocks(&outcome.public_key), 1);
}

#[tokio::test]
async fn test_renewal_before_expiry_stacks() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let first = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    harness.clock.advance(Duration::days(10));
    let renewed = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();

    assert_eq!(renewed.action, ProvisionAction::Renewed);
    assert_eq!(renewed.order_id, first.order_id);
    assert_eq!(renewed.expires_at, Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap());
    assert_eq!(renewed.public_key, first.public_key);
    assert_eq!(renewed.client_address, first.client_address);

    // No second address and no second registration
    assert_eq!(coordinator.allocator().allocated_count(), 1);
    assert_eq!(harness.control.add_calls(), 1);
}

#[tokio::test]
async fn test_renewal_after_expiry_restarts_from_now() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let first = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    harness.clock.advance(Duration::days(40));
    let report = coordinator.sweep().await.unwrap();
    assert_eq!(report.expired, vec![first.order_id]);

    let now = harness.clock.now();
    let renewed = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    assert_eq!(renewed.expires_at, now + chrono::Months::new(1));
    assert_eq!(renewed.action, ProvisionAction::Reactivated);
}

#[tokio::test]
async fn test_reactivation_reuses_identity() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let first = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    harness.clock.advance(Duration::days(45));
    coordinator.sweep().await.unwrap();
    assert!(!harness.control.has_peer(&first.public_key));

    let reactivated = coordinator.create_or_renew(&pay("a@x.com", 2)).await.unwrap();

    assert_eq!(reactivated.action, ProvisionAction::Reactivated);
    assert_eq!(reactivated.order_id, first.order_id);
    assert_eq!(reactivated.public_key, first.public_key);
    assert_eq!(reactivated.client_address, first.client_address);
    assert_eq!(reactivated.config_path, first.config_path);
    assert_eq!(coordinator.allocator().allocated_count(), 1);

    // Registered again, still one block in the peer-config file
    assert!(harness.control.has_peer(&first.public_key));
    assert_eq!(harness.peer_blocks(&first.public_key), 1);

    let row = harness.repo.get(first.order_id).unwrap().unwrap();
    assert_eq!(row.status, SubscriptionStatus::Paid);
    assert_eq!(row.plan_id, 2);
}

#[tokio::test]
async fn test_missing_artifact_gets_fresh_peer() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let first = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    harness.clock.advance(Duration::days(45));
    coordinator.sweep().await.unwrap();
    std::fs::remove_file(&first.config_path).unwrap();

    let outcome = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();

    assert_eq!(outcome.action, ProvisionAction::Reprovisioned);
    assert_eq!(outcome.order_id, first.order_id);
    assert_ne!(outcome.public_key, first.public_key);
    assert!(outcome.config_path.exists());
    assert_eq!(harness.peer_blocks(&first.public_key), 0);
    assert_eq!(harness.peer_blocks(&outcome.public_key), 1);
    // The previous address is returned to the pool
    assert_eq!(coordinator.allocator().allocated_count(), 1);
}

// ============================================================================
// Validation and failures
// ============================================================================

#[tokio::test]
async fn test_invalid_requests_have_no_side_effects() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let unknown = coordinator.create_or_renew(&pay("a@x.com", 99)).await;
    assert!(matches!(
        unknown,
        Err(LifecycleError::Validation(ValidationError::UnknownPlan { plan_id: 99 }))
    ));

    // The trial plan is free and cannot be bought
    let free = coordinator.create_or_renew(&pay("a@x.com", TRIAL_PLAN_ID)).await;
    assert!(matches!(free, Err(LifecycleError::Validation(_))));

    let blank = coordinator.create_or_renew(&pay("   ", 1)).await;
    assert!(matches!(
        blank,
        Err(LifecycleError::Validation(ValidationError::EmptyIdentifier))
    ));

    assert!(harness.repo.find_latest_by_identifier("a@x.com").unwrap().is_none());
    assert_eq!(coordinator.allocator().allocated_count(), 0);
    assert_eq!(harness.control.add_calls(), 0);
    assert!(harness.peer_file().is_empty());
}

#[tokio::test]
async fn test_pool_exhaustion() {
    // A /30 has two usable hosts
    let harness = Harness::with_subnet("10.9.0.0/30");
    let mut coordinator = harness.coordinator();

    coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    coordinator.create_or_renew(&pay("b@x.com", 1)).await.unwrap();
    let third = coordinator.create_or_renew(&pay("c@x.com", 1)).await;

    assert!(matches!(
        third,
        Err(LifecycleError::Allocation(IpAllocatorError::Exhausted))
    ));
    assert!(harness.repo.find_latest_by_identifier("c@x.com").unwrap().is_none());
    assert_eq!(harness.control.add_calls(), 2);
}

#[tokio::test]
async fn test_keygen_failure_releases_address() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();
    harness.control.set_fail_keygen(true);

    let result = coordinator.create_or_renew(&pay("a@x.com", 1)).await;

    assert!(matches!(result, Err(LifecycleError::Control(_))));
    assert_eq!(coordinator.allocator().allocated_count(), 0);
    assert!(harness.repo.find_latest_by_identifier("a@x.com").unwrap().is_none());
}

#[tokio::test]
async fn test_failed_registration_is_degraded_not_fatal() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();
    harness.control.set_fail_add(true);

    let outcome = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();

    assert!(outcome.degraded);
    let row = harness.repo.get(outcome.order_id).unwrap().unwrap();
    assert_eq!(row.status, SubscriptionStatus::Paid);
    assert!(outcome.config_path.exists());
    assert!(!harness.control.has_peer(&outcome.public_key));
    assert_eq!(harness.peer_blocks(&outcome.public_key), 0);
}

#[tokio::test]
async fn test_notification_failure_does_not_reverse_payment() {
    let harness = Harness::new().with_failing_notifier();
    let mut coordinator = harness.coordinator();

    let outcome = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    settle().await;

    let received = harness.notifier.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].order_id, outcome.order_id);
    assert_eq!(
        harness.repo.get(outcome.order_id).unwrap().unwrap().status,
        SubscriptionStatus::Paid
    );
}

#[tokio::test]
async fn test_notification_carries_artifact_and_expiry() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let mut request = pay("a@x.com", 3);
    request.messaging_id = Some(4242);
    let outcome = coordinator.create_or_renew(&request).await.unwrap();
    settle().await;

    let received = harness.notifier.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].config_path, outcome.config_path);
    assert_eq!(received[0].expires_at, Some(outcome.expires_at));
    assert_eq!(received[0].messaging_id, Some(4242));
    assert_eq!(outcome.expires_at, Utc.with_ymd_and_hms(2027, 1, 15, 12, 0, 0).unwrap());
}

// ============================================================================
// Checkout, status and owner identity
// ============================================================================

#[tokio::test]
async fn test_checkout_is_promoted_on_payment() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let order_id = coordinator.register_checkout(&pay("a@x.com", 2)).unwrap();
    let state = coordinator.get_status("a@x.com").unwrap();
    assert_eq!(state.status, SubscriptionStatus::Pending);
    assert_eq!(state.expires_at, None);
    assert_eq!(coordinator.allocator().allocated_count(), 0);

    let outcome = coordinator.create_or_renew(&pay("a@x.com", 2)).await.unwrap();
    assert_eq!(outcome.order_id, order_id);
    assert_eq!(outcome.action, ProvisionAction::Created);

    let state = coordinator.get_status("a@x.com").unwrap();
    assert_eq!(state.status, SubscriptionStatus::Paid);
    assert_eq!(state.expires_at, Some(t0() + chrono::Months::new(6)));
}

#[tokio::test]
async fn test_status_of_unknown_identifier() {
    let harness = Harness::new();
    let coordinator = harness.coordinator();

    assert!(matches!(
        coordinator.get_status("nobody@x.com"),
        Err(LifecycleError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_owner_ids_filled_when_absent() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let first = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    assert_eq!(harness.repo.get(first.order_id).unwrap().unwrap().user_id, None);

    let mut renewal = pay("a@x.com", 1);
    renewal.user_id = Some(7);
    coordinator.create_or_renew(&renewal).await.unwrap();
    assert_eq!(harness.repo.get(first.order_id).unwrap().unwrap().user_id, Some(7));

    // An existing owner is never overwritten
    renewal.user_id = Some(8);
    coordinator.create_or_renew(&renewal).await.unwrap();
    assert_eq!(harness.repo.get(first.order_id).unwrap().unwrap().user_id, Some(7));
}

// ============================================================================
// Trial, tokens and revoke
// ============================================================================

fn trial(identifier: &str) -> TrialRequest {
    TrialRequest {
        identifier: identifier.to_string(),
        user_id: None,
        messaging_id: None,
    }
}

#[tokio::test]
async fn test_trial_granted_once() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let outcome = coordinator.grant_trial(&trial("t@x.com")).await.unwrap();
    assert_eq!(outcome.action, ProvisionAction::Created);
    assert_eq!(outcome.expires_at, t0() + Duration::days(3));

    let row = harness.repo.get(outcome.order_id).unwrap().unwrap();
    assert_eq!(row.plan_id, TRIAL_PLAN_ID);
    assert_eq!(row.price, 0.0);

    let again = coordinator.grant_trial(&trial("t@x.com")).await;
    assert!(matches!(again, Err(LifecycleError::TrialAlreadyUsed { .. })));
    assert_eq!(coordinator.allocator().allocated_count(), 1);
}

#[tokio::test]
async fn test_trial_refused_for_paying_identifier() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    let result = coordinator.grant_trial(&trial("a@x.com")).await;
    assert!(matches!(result, Err(LifecycleError::TrialAlreadyUsed { .. })));
}

#[tokio::test]
async fn test_trial_then_payment_extends_trial_row() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let granted = coordinator.grant_trial(&trial("t@x.com")).await.unwrap();
    let paid = coordinator.create_or_renew(&pay("t@x.com", 1)).await.unwrap();

    assert_eq!(paid.order_id, granted.order_id);
    assert_eq!(paid.action, ProvisionAction::Renewed);
    assert_eq!(paid.expires_at, granted.expires_at + chrono::Months::new(1));
}

#[tokio::test]
async fn test_access_token_is_single_use() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let outcome = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    let issued = coordinator.issue_access_token("a@x.com").unwrap();
    assert_eq!(issued.order_id, outcome.order_id);
    assert_eq!(issued.token.len(), 32);

    let redeemed = coordinator.redeem_access_token(&issued.token).unwrap();
    assert_eq!(redeemed.order_id, outcome.order_id);
    assert!(redeemed.config_text.contains("[Interface]"));
    assert!(redeemed.config_text.contains(&outcome.client_address.to_string()));

    let second = coordinator.redeem_access_token(&issued.token);
    assert!(matches!(second, Err(LifecycleError::TokenInvalid)));
    assert_eq!(harness.repo.get(outcome.order_id).unwrap().unwrap().access_token, None);
}

#[tokio::test]
async fn test_access_token_requires_paid_subscription() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    coordinator.register_checkout(&pay("a@x.com", 1)).unwrap();
    assert!(matches!(
        coordinator.issue_access_token("a@x.com"),
        Err(LifecycleError::NotFound(_))
    ));
    assert!(matches!(
        coordinator.redeem_access_token("not-a-token"),
        Err(LifecycleError::TokenInvalid)
    ));
}

#[tokio::test]
async fn test_revoke_releases_everything() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let outcome = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    let revoked = coordinator.revoke(&outcome.public_key).await.unwrap();

    assert_eq!(revoked.order_id, outcome.order_id);
    assert_eq!(revoked.released_address, Some(outcome.client_address));
    assert!(!harness.control.has_peer(&outcome.public_key));
    assert_eq!(harness.peer_blocks(&outcome.public_key), 0);
    assert!(!outcome.config_path.exists());

    let row = harness.repo.get(outcome.order_id).unwrap().unwrap();
    assert_eq!(row.status, SubscriptionStatus::Expired);
    assert_eq!(row.client_address, None);
    assert_eq!(row.config_path, None);

    // The address is available to the next subscriber
    let next = coordinator.create_or_renew(&pay("b@x.com", 1)).await.unwrap();
    assert_eq!(next.client_address, outcome.client_address);
}

#[tokio::test]
async fn test_revoked_subscription_gets_new_identity_on_payment() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let outcome = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    coordinator.revoke(&outcome.public_key).await.unwrap();

    let renewed = coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap();
    assert_eq!(renewed.order_id, outcome.order_id);
    assert_eq!(renewed.action, ProvisionAction::Reprovisioned);
    assert_ne!(renewed.public_key, outcome.public_key);
}

#[tokio::test]
async fn test_revoke_unknown_key() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let result = coordinator
        .revoke("HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=")
        .await;
    assert!(matches!(result, Err(LifecycleError::NotFound(_))));

    let malformed = coordinator.revoke("short").await;
    assert!(matches!(malformed, Err(LifecycleError::Validation(_))));
}

// ============================================================================
// Peer store
// ============================================================================

#[tokio::test]
async fn test_add_peer_twice_writes_one_block() {
    let harness = Harness::new();
    let store = harness.peer_store();
    let key = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";

    store.add_peer(key, Ipv4Addr::new(10, 0, 0, 9)).await.unwrap();
    store.add_peer(key, Ipv4Addr::new(10, 0, 0, 9)).await.unwrap();

    assert_eq!(harness.peer_blocks(key), 1);
    assert_eq!(harness.control.add_calls(), 2);
}

#[tokio::test]
async fn test_restart_seeds_allocator_from_datastore() {
    let harness = Harness::new();
    let first = {
        let mut coordinator = harness.coordinator();
        coordinator.create_or_renew(&pay("a@x.com", 1)).await.unwrap()
    };

    // A fresh coordinator over the same state must not hand out the address again
    let mut coordinator = harness.coordinator();
    assert!(coordinator.allocator().is_allocated(first.client_address));
    let second = coordinator.create_or_renew(&pay("b@x.com", 1)).await.unwrap();
    assert_ne!(second.client_address, first.client_address);
}

// ============================================================================
// Worker serialization
// ============================================================================

#[tokio::test]
async fn test_concurrent_payments_get_distinct_addresses() {
    let harness = Harness::new();
    let (handle, _worker, shutdown_tx) = harness.spawn();

    let tasks: Vec<_> = (0..40)
        .map(|i| {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .create_or_renew(pay(&format!("user{i}@x.com"), 1))
                    .await
            })
        })
        .collect();

    let mut addresses = HashSet::new();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.action, ProvisionAction::Created);
        assert!(addresses.insert(outcome.client_address));
    }

    assert_eq!(addresses.len(), 40);
    let status = handle.status().await.unwrap();
    assert_eq!(status.allocated_addresses, 40);
    assert_eq!(status.paid, 40);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_timed_out_request_is_not_retryable_and_queued_one_is_dropped() {
    let harness = Harness::new();
    harness
        .control
        .set_add_delay(Some(StdDuration::from_millis(1500)));
    let (handle, _worker, shutdown_tx) = harness.spawn_with(&LifecycleConfig {
        queue_capacity: 8,
        request_timeout_secs: 1,
    });

    // The first request is running when it times out; the second is still queued
    let (running, queued) = tokio::join!(
        handle.create_or_renew(pay("a@x.com", 1)),
        handle.create_or_renew(pay("b@x.com", 1)),
    );
    for result in [running, queued] {
        let err = result.unwrap_err();
        assert!(matches!(err, LifecycleError::Timeout { .. }));
        assert!(!err.is_recoverable());
    }

    harness.control.set_add_delay(None);
    tokio::time::sleep(StdDuration::from_millis(1000)).await;

    // The running request finished with exactly one plan period
    let state = handle.get_status("a@x.com").await.unwrap();
    assert_eq!(state.status, SubscriptionStatus::Paid);
    assert_eq!(
        state.expires_at,
        Some(Utc.with_ymd_and_hms(2026, 2, 15, 12, 0, 0).unwrap())
    );

    // The abandoned one never ran
    assert!(matches!(
        handle.get_status("b@x.com").await,
        Err(LifecycleError::NotFound(_))
    ));
    assert_eq!(harness.control.add_calls(), 1);

    let _ = shutdown_tx.send(());
}

// ============================================================================
// Owner listing
// ============================================================================

#[tokio::test]
async fn test_list_by_owner_reports_config_availability() {
    let harness = Harness::new();
    let mut coordinator = harness.coordinator();

    let kept = coordinator
        .create_or_renew(&PaymentConfirmation {
            user_id: Some(7),
            ..pay("a@x.com", 1)
        })
        .await
        .unwrap();
    let lost = coordinator
        .create_or_renew(&PaymentConfirmation {
            user_id: Some(7),
            ..pay("b@x.com", 3)
        })
        .await
        .unwrap();
    coordinator.create_or_renew(&pay("c@x.com", 1)).await.unwrap();
    std::fs::remove_file(&lost.config_path).unwrap();

    let owned = coordinator.list_by_owner(7).unwrap();
    assert_eq!(owned.len(), 2);
    assert_eq!(owned[0].order_id, lost.order_id);
    assert!(!owned[0].has_config);
    assert_eq!(owned[1].order_id, kept.order_id);
    assert!(owned[1].has_config);
    assert_eq!(owned[1].status, SubscriptionStatus::Paid);
    assert_eq!(owned[1].expires_at, Some(kept.expires_at));
    assert_eq!(owned[1].plan_label, "1 month");
}

//! IPC control surface tests
//!
//! Runs the Unix socket server over a real lifecycle worker and drives it
//! with `IpcClient`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use wg_provisioner::config::IpcConfig;
use wg_provisioner::error::IpcError;
use wg_provisioner::ipc::{
    ErrorCode, IpcClient, IpcHandler, IpcResponse, IpcServer, LENGTH_PREFIX_SIZE,
};
use wg_provisioner::lifecycle::PaymentConfirmation;
use wg_provisioner::subscription::SubscriptionStatus;

use super::Harness;

struct Running {
    socket_path: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
    server: JoinHandle<()>,
}

async fn start(harness: &Harness) -> Running {
    let (lifecycle, _worker, shutdown_tx) = harness.spawn();
    let socket_path = harness.dir.path().join("provisioner.sock");

    let config = IpcConfig {
        socket_path: socket_path.clone(),
        socket_mode: 0o660,
        enabled: true,
        max_message_size: 64 * 1024,
    };
    let handler = Arc::new(IpcHandler::new(lifecycle, shutdown_tx.clone()));
    let server = IpcServer::new(config, handler, shutdown_tx.clone());
    let server = tokio::spawn(async move {
        server.run().await.unwrap();
    });

    // Wait for the socket to appear
    for _ in 0..50 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Running {
        socket_path,
        shutdown_tx,
        server,
    }
}

#[tokio::test]
async fn test_payment_over_ipc() {
    let harness = Harness::new();
    let running = start(&harness).await;
    let client = IpcClient::new(&running.socket_path);

    assert!(client.ping().await.unwrap());

    let outcome = client
        .create_or_renew(PaymentConfirmation::new("a@x.com", 1))
        .await
        .unwrap();
    assert!(outcome.config_path.exists());
    assert!(harness.control.has_peer(&outcome.public_key));

    let state = client.get_status("a@x.com").await.unwrap();
    assert_eq!(state.status, SubscriptionStatus::Paid);
    assert_eq!(state.expires_at, Some(outcome.expires_at));

    let status = client.status().await.unwrap();
    assert_eq!(status.worker.backend, "memory");
    assert_eq!(status.worker.paid, 1);
    assert_eq!(status.worker.allocated_addresses, 1);

    running.shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), running.server)
        .await
        .unwrap()
        .unwrap();
    assert!(!running.socket_path.exists());
}

#[tokio::test]
async fn test_errors_carry_codes() {
    let harness = Harness::new();
    let running = start(&harness).await;
    let client = IpcClient::new(&running.socket_path);

    let err = client
        .create_or_renew(PaymentConfirmation::new("a@x.com", 42))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IpcError::Remote {
            code: ErrorCode::InvalidParameters,
            ..
        }
    ));

    let err = client.redeem_access_token("unknown").await.unwrap_err();
    assert!(matches!(
        err,
        IpcError::Remote {
            code: ErrorCode::InvalidToken,
            ..
        }
    ));
    assert!(!err.is_recoverable());

    let _ = running.shutdown_tx.send(());
}

#[tokio::test]
async fn test_list_plans() {
    let harness = Harness::new();
    let running = start(&harness).await;
    let client = IpcClient::new(&running.socket_path);

    let plans = client.list_plans().await.unwrap();
    let ids: Vec<u32> = plans.iter().map(|plan| plan.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let _ = running.shutdown_tx.send(());
}

#[tokio::test]
async fn test_malformed_frame_gets_error_response() {
    let harness = Harness::new();
    let running = start(&harness).await;

    let mut stream = UnixStream::connect(&running.socket_path).await.unwrap();
    let body = br#"{"type":"no_such_command"}"#;
    stream
        .write_all(&u32::try_from(body.len()).unwrap().to_be_bytes())
        .await
        .unwrap();
    stream.write_all(body).await.unwrap();

    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    stream.read_exact(&mut len_buf).await.unwrap();
    let mut msg = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut msg).await.unwrap();

    let response: IpcResponse = serde_json::from_slice(&msg).unwrap();
    match response {
        IpcResponse::Error(err) => assert_eq!(err.code, ErrorCode::InvalidCommand),
        other => panic!("unexpected response: {other:?}"),
    }

    let _ = running.shutdown_tx.send(());
}

#[tokio::test]
async fn test_shutdown_command_stops_server() {
    let harness = Harness::new();
    let running = start(&harness).await;
    let client = IpcClient::new(&running.socket_path);

    client.shutdown().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), running.server)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_owner_listing_over_ipc() {
    let harness = Harness::new();
    let running = start(&harness).await;
    let client = IpcClient::new(&running.socket_path);

    let paid = client
        .create_or_renew(PaymentConfirmation {
            user_id: Some(7),
            ..PaymentConfirmation::new("a@x.com", 1)
        })
        .await
        .unwrap();
    let checkout = client
        .register_checkout(PaymentConfirmation {
            user_id: Some(7),
            ..PaymentConfirmation::new("b@x.com", 2)
        })
        .await
        .unwrap();

    let owned = client.list_by_owner(7).await.unwrap();
    let ids: Vec<i64> = owned.iter().map(|sub| sub.order_id).collect();
    assert_eq!(ids, vec![checkout, paid.order_id]);
    assert_eq!(owned[0].status, SubscriptionStatus::Pending);
    assert!(!owned[0].has_config);
    assert_eq!(owned[1].status, SubscriptionStatus::Paid);
    assert_eq!(owned[1].expires_at, Some(paid.expires_at));
    assert!(owned[1].has_config);

    assert!(client.list_by_owner(8).await.unwrap().is_empty());

    let _ = running.shutdown_tx.send(());
}

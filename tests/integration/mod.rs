//! Integration tests for wg-provisioner
//!
//! Every test runs against a real SQLite file, a real peer-config file and
//! real artifacts in a temporary directory. The live interface is replaced
//! by the in-memory control backend and time by a manual clock.
//!
//! # Test Organization
//!
//! - `lifecycle_flow`: paid-entry, renewal stacking, reactivation, trials, tokens, revoke
//! - `sweeper`: expiry sweeps, the periodic driver and reconciliation
//! - `ipc_flow`: the Unix socket control surface end to end

pub mod ipc_flow;
pub mod lifecycle_flow;
pub mod sweeper;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use wg_provisioner::config::LifecycleConfig;
use wg_provisioner::lifecycle::{spawn_worker, LifecycleCoordinator, LifecycleHandle, RecordingNotifier};
use wg_provisioner::peer::{ClientIpAllocator, ConfigGenerator, MemoryControl, PeerStore};
use wg_provisioner::subscription::{ManualClock, OrderRepository};

/// Server key written into client configs
pub const SERVER_PUBLIC_KEY: &str = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";

/// Server endpoint written into client configs
pub const SERVER_ENDPOINT: &str = "203.0.113.7:51820";

/// Fixed start instant for deterministic expiry arithmetic
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap()
}

/// Everything a lifecycle test needs to build and inspect a coordinator
pub struct Harness {
    pub dir: TempDir,
    pub control: Arc<MemoryControl>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub repo: OrderRepository,
    pub subnet: String,
}

impl Harness {
    /// Harness over a /24 client network
    pub fn new() -> Self {
        Self::with_subnet("10.0.0.0/24")
    }

    /// Harness over a custom client network
    pub fn with_subnet(subnet: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = OrderRepository::open(&dir.path().join("subscriptions.db")).unwrap();
        Self {
            dir,
            control: Arc::new(MemoryControl::new()),
            clock: Arc::new(ManualClock::new(t0())),
            notifier: Arc::new(RecordingNotifier::new()),
            repo,
            subnet: subnet.to_string(),
        }
    }

    /// Replace the notifier with one that rejects every delivery
    pub fn with_failing_notifier(mut self) -> Self {
        self.notifier = Arc::new(RecordingNotifier::failing());
        self
    }

    pub fn peer_config_path(&self) -> PathBuf {
        self.dir.path().join("wg0.conf")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.dir.path().join("configs")
    }

    pub fn peer_store(&self) -> PeerStore {
        PeerStore::new(self.control.clone(), self.peer_config_path())
    }

    /// Build and seed a coordinator over the harness state
    pub fn coordinator(&self) -> LifecycleCoordinator {
        let generator =
            ConfigGenerator::new(self.config_dir(), SERVER_PUBLIC_KEY, SERVER_ENDPOINT, "1.1.1.1");
        let mut coordinator = LifecycleCoordinator::new(
            self.repo.clone(),
            self.peer_store(),
            generator,
            ClientIpAllocator::new(&self.subnet).unwrap(),
            self.clock.clone(),
            self.notifier.clone(),
        );
        coordinator.seed_allocator().unwrap();
        coordinator
    }

    /// Spawn a worker over a fresh coordinator
    pub fn spawn(&self) -> (LifecycleHandle, JoinHandle<()>, broadcast::Sender<()>) {
        self.spawn_with(&LifecycleConfig::default())
    }

    /// Spawn a worker with custom queue and timeout limits
    pub fn spawn_with(
        &self,
        config: &LifecycleConfig,
    ) -> (LifecycleHandle, JoinHandle<()>, broadcast::Sender<()>) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (handle, task) = spawn_worker(self.coordinator(), config, shutdown_tx.subscribe());
        (handle, task, shutdown_tx)
    }

    /// Contents of the peer-config file
    pub fn peer_file(&self) -> String {
        std::fs::read_to_string(self.peer_config_path()).unwrap_or_default()
    }

    /// Number of `[Peer]` blocks for a key in the peer-config file
    pub fn peer_blocks(&self, public_key: &str) -> usize {
        self.peer_store().block_count(public_key).unwrap()
    }
}

/// Wait until spawned notification tasks have run
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}

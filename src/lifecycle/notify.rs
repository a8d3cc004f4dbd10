//! Notification delivery
//!
//! After every successful paid-entry the coordinator hands a
//! [`Notification`] to a [`Notifier`] on a spawned task. Delivery is best
//! effort: failures are logged and never reach the caller.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NotifyConfig;
use crate::error::NotifyError;

/// What happened to the subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionAction {
    /// First paid-entry with a fresh peer
    Created,
    /// Validity extended on a live subscription
    Renewed,
    /// Expired subscription brought back with its prior identity
    Reactivated,
    /// Existing row given a fresh peer because its artifact was gone
    Reprovisioned,
}

/// Message for the delivery collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub order_id: i64,
    pub identifier: String,
    pub config_path: PathBuf,
    pub expires_at: Option<DateTime<Utc>>,
    pub action: ProvisionAction,
    pub messaging_id: Option<i64>,
}

/// Delivery collaborator
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;

    /// Name for logs
    fn name(&self) -> &'static str;
}

/// Build the notifier selected in configuration
#[must_use]
pub fn notifier_from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    match &config.spool_dir {
        Some(dir) => Arc::new(SpoolNotifier::new(dir.clone())),
        None => Arc::new(LogNotifier),
    }
}

/// Deliver on a background task, logging failures
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) -> JoinHandle<()> {
    tokio::spawn(async move {
        match notifier.notify(&notification).await {
            Ok(()) => debug!(
                order_id = notification.order_id,
                "Notification delivered via {}",
                notifier.name()
            ),
            Err(e) => warn!(
                order_id = notification.order_id,
                "Notification via {} failed: {}",
                notifier.name(),
                e
            ),
        }
    })
}

/// Logs notifications and does nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            order_id = notification.order_id,
            action = ?notification.action,
            "Config ready for {} at {:?}",
            notification.identifier,
            notification.config_path
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Writes one JSON document per notification into a spool directory
#[derive(Debug, Clone)]
pub struct SpoolNotifier {
    dir: PathBuf,
}

impl SpoolNotifier {
    /// Create a spool notifier over `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Notifier for SpoolNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let body = serde_json::to_vec_pretty(notification)
            .map_err(|e| NotifyError::Serialization(e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let stem = format!(
            "{}-{}",
            notification.order_id,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let tmp = self.dir.join(format!("{stem}.tmp"));
        let path = self.dir.join(format!("{stem}.json"));

        // Readers only pick up complete documents
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Spooled notification {:?}", path);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "spool"
    }
}

/// Keeps every notification in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    /// Create a notifier that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a notifier that records and then rejects
    #[must_use]
    pub fn failing() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Notifications seen so far
    #[must_use]
    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.received.lock().push(notification.clone());
        if self.fail {
            return Err(NotifyError::Rejected("recording notifier set to fail".into()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

//! Notification Sink
//!
//! User-facing messages leave the recovery core through `NotificationSink`.
//! Sending never blocks and never waits for acknowledgment.

use crate::classifier::{ErrorKind, Severity};
use crate::types::{ErrorRecord, OutcomeDetail, RecoveryOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A message for the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub severity: Severity,
    pub title: String,
    pub user_message: String,
    pub suggested_action: Option<String>,
    pub module_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(severity: Severity, title: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            title: title.into(),
            user_message: user_message.into(),
            suggested_action: None,
            module_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }

    pub fn for_module(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    /// Notification for a classified fault
    pub fn from_error(record: &ErrorRecord) -> Self {
        let title = match record.severity {
            Severity::Critical => format!("Critical problem in {}", record.module_id),
            Severity::High => format!("{} needs attention", record.module_id),
            Severity::Medium | Severity::Low => format!("{} hit a problem", record.module_id),
        };
        let message = if record.context.is_empty() {
            record.message.clone()
        } else {
            format!("{} while {}", record.message, record.context)
        };
        Self::new(record.severity, title, message)
            .with_action(suggested_action(record.kind))
            .for_module(record.module_id.clone())
    }

    /// Notification for a recovery decision
    pub fn from_outcome(outcome: &RecoveryOutcome) -> Self {
        let (severity, title) = match (&outcome.detail, outcome.success) {
            (OutcomeDetail::FallbackFailed, _) | (OutcomeDetail::Escalated, _) => {
                (Severity::Critical, "Module stopped")
            }
            (OutcomeDetail::AttemptsExhausted { .. }, _) | (OutcomeDetail::FallbackEngaged, _) => {
                (Severity::High, "Running in reduced mode")
            }
            (_, Some(true)) => (Severity::Low, "Recovery successful"),
            _ => (Severity::Medium, "Recovery failed"),
        };

        let mut notification = Self::new(severity, title, outcome.message.clone())
            .for_module(outcome.module_id.clone());
        if severity >= Severity::High {
            notification = notification.with_action("Re-enable the module from Settings once the problem is fixed");
        }
        notification
    }
}

/// Default advice for an error kind
pub fn suggested_action(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Network => "Check the Wi-Fi connection",
        ErrorKind::ExternalApi => "Sign in to the service again from Settings",
        ErrorKind::Hardware => "Check that the device is connected",
        ErrorKind::Config => "Review the module settings",
        ErrorKind::Permission => "Check file and device permissions",
        ErrorKind::Memory => "Close modules you are not using",
        ErrorKind::Timeout => "Try again in a moment",
        ErrorKind::Module | ErrorKind::System | ErrorKind::Unknown => "Restart StosOS if this keeps happening",
    }
}

/// Receiver of user-facing messages
pub trait NotificationSink: Send + Sync {
    /// Deliver without blocking
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log only
#[derive(Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, n: Notification) {
        let module = n.module_id.as_deref().unwrap_or("system");
        match n.severity {
            Severity::Critical | Severity::High => {
                error!("[{}] {}: {}", module, n.title, n.user_message)
            }
            Severity::Medium => warn!("[{}] {}: {}", module, n.title, n.user_message),
            Severity::Low => info!("[{}] {}: {}", module, n.title, n.user_message),
        }
    }
}

/// Forwards notifications into an async channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<Notification>) -> Self {
        Self { tx }
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            warn!("Notification receiver dropped; message discarded");
        }
    }
}

/// Keeps notifications in memory, for UIs that poll
#[derive(Debug, Default)]
pub struct MemorySink {
    received: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Remove and return everything received so far
    pub fn drain(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.received.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl NotificationSink for MemorySink {
    fn notify(&self, notification: Notification) {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }
}

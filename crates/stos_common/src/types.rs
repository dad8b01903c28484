//! Record types shared by the manager, the history stores and the daemon.

use crate::classifier::{ErrorKind, Severity};
use crate::strategy::RecoveryAction;
use crate::tracker::ModuleStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One classified fault. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub kind: ErrorKind,
    /// Severity after pattern escalation
    pub severity: Severity,
    pub message: String,
    /// Where in the module the fault was caught
    pub context: String,
    pub module_id: String,
    /// Same (module, kind) faults inside the pattern window, this one included
    pub occurrences: u32,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(
        module_id: impl Into<String>,
        kind: ErrorKind,
        severity: Severity,
        message: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            message: message.into(),
            context: context.into(),
            module_id: module_id.into(),
            occurrences: 1,
            timestamp: Utc::now(),
        }
    }

    pub fn with_occurrences(mut self, occurrences: u32) -> Self {
        self.occurrences = occurrences;
        self
    }
}

/// Why a recovery decision ended the way it did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeDetail {
    /// Retry is left to the caller
    Deferred,
    Restarted,
    /// Restart hook reported reduced functionality
    PartiallyRestarted,
    /// Restart hook failed; module stays eligible for another attempt
    RestartFailed { attempts: u32 },
    /// Restart hook failed and the attempt budget is spent
    AttemptsExhausted { attempts: u32 },
    CoolingDown { remaining_ms: u64 },
    RestartInProgress,
    FallbackEngaged,
    /// Fallback hook failed; module is now failed
    FallbackFailed,
    /// Module is in a state that accepts no recovery until re-enabled
    Unavailable { status: ModuleStatus },
    Escalated,
    Notified,
    UnknownModule,
}

impl OutcomeDetail {
    /// Short label for logs and notifications
    pub fn label(&self) -> &'static str {
        match self {
            Self::Deferred => "deferred",
            Self::Restarted => "restarted",
            Self::PartiallyRestarted => "partially restarted",
            Self::RestartFailed { .. } => "restart failed",
            Self::AttemptsExhausted { .. } => "attempts exhausted",
            Self::CoolingDown { .. } => "cooling down",
            Self::RestartInProgress => "restart already in progress",
            Self::FallbackEngaged => "fallback engaged",
            Self::FallbackFailed => "fallback failed",
            Self::Unavailable { .. } => "unavailable",
            Self::Escalated => "escalated",
            Self::Notified => "notified",
            Self::UnknownModule => "unknown module",
        }
    }
}

/// Result of one recovery decision cycle for a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub id: Uuid,
    pub module_id: String,
    pub action: RecoveryAction,
    /// None when the outcome is decided elsewhere (Retry, notify-only)
    pub success: Option<bool>,
    pub detail: OutcomeDetail,
    /// Module status once the decision completed
    pub status_after: Option<ModuleStatus>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryOutcome {
    pub fn new(
        module_id: impl Into<String>,
        action: RecoveryAction,
        success: Option<bool>,
        detail: OutcomeDetail,
    ) -> Self {
        let module_id = module_id.into();
        let message = format!("{}: {} ({})", module_id, action, detail.label());
        Self {
            id: Uuid::new_v4(),
            module_id,
            action,
            success,
            detail,
            status_after: None,
            message,
            timestamp: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: ModuleStatus) -> Self {
        self.status_after = Some(status);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_cooling_down(&self) -> bool {
        matches!(self.detail, OutcomeDetail::CoolingDown { .. })
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self.detail, OutcomeDetail::RestartInProgress)
    }
}

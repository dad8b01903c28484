//! Error types for the recovery core.

use crate::tracker::ModuleStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Module '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Module '{0}' is not registered")]
    UnknownModule(String),

    #[error("Module '{module}' cannot move from {from} to {to}")]
    InvalidTransition {
        module: String,
        from: ModuleStatus,
        to: ModuleStatus,
    },

    #[error("Module '{0}' has a recovery operation in progress")]
    ModuleBusy(String),

    #[error("Module '{module}' hook failed: {reason}")]
    HookFailed { module: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RecoveryError {
    /// Stable short code, used in logs and JSON reports
    pub fn code(&self) -> &'static str {
        match self {
            RecoveryError::AlreadyRegistered(_) => "already_registered",
            RecoveryError::UnknownModule(_) => "unknown_module",
            RecoveryError::InvalidTransition { .. } => "invalid_transition",
            RecoveryError::ModuleBusy(_) => "module_busy",
            RecoveryError::HookFailed { .. } => "hook_failed",
            RecoveryError::Config(_) => "config",
            RecoveryError::Io(_) => "io",
            RecoveryError::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RecoveryError::UnknownModule("calendar".to_string());
        assert_eq!(err.to_string(), "Module 'calendar' is not registered");
        assert_eq!(err.code(), "unknown_module");

        let err = RecoveryError::InvalidTransition {
            module: "spotify".to_string(),
            from: ModuleStatus::Restarting,
            to: ModuleStatus::Restarting,
        };
        assert!(err.to_string().contains("restarting"));
    }
}

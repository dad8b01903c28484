//! Recovery Strategy Table
//!
//! Maps an error kind to the recovery action the manager should take.

use crate::classifier::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Recovery action type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Caller retries at its own call site
    Retry,
    /// Restart the module through its restart hook
    RestartModule,
    /// Switch the module to reduced functionality
    EnableFallback,
    /// Tell the user, change nothing
    NotifyUserOnly,
    /// Surface directly to the user/operator
    EscalateFatal,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::RestartModule => "restart_module",
            Self::EnableFallback => "enable_fallback",
            Self::NotifyUserOnly => "notify_user_only",
            Self::EscalateFatal => "escalate_fatal",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error kind to recovery action lookup
#[derive(Debug, Clone)]
pub struct StrategyTable {
    actions: BTreeMap<ErrorKind, RecoveryAction>,
}

impl StrategyTable {
    /// Table with the default mapping
    pub fn new() -> Self {
        let actions = ErrorKind::ALL
            .iter()
            .map(|kind| (*kind, default_action(*kind)))
            .collect();
        Self { actions }
    }

    /// Build the default table and apply overrides in order
    pub fn with_overrides<'a>(
        overrides: impl IntoIterator<Item = (&'a ErrorKind, &'a RecoveryAction)>,
    ) -> Self {
        let mut table = Self::new();
        for (kind, action) in overrides {
            table.register(*kind, *action);
        }
        table
    }

    /// Override the action for one kind; last registration wins
    pub fn register(&mut self, kind: ErrorKind, action: RecoveryAction) {
        debug!("Recovery strategy for {} set to {}", kind, action);
        self.actions.insert(kind, action);
    }

    pub fn strategy_for(&self, kind: ErrorKind) -> RecoveryAction {
        self.actions
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_action(kind))
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::new()
    }
}

fn default_action(kind: ErrorKind) -> RecoveryAction {
    match kind {
        ErrorKind::Network | ErrorKind::Hardware | ErrorKind::Module => {
            RecoveryAction::RestartModule
        }
        ErrorKind::ExternalApi | ErrorKind::Timeout => RecoveryAction::Retry,
        ErrorKind::Memory | ErrorKind::System => RecoveryAction::EnableFallback,
        ErrorKind::Config | ErrorKind::Permission | ErrorKind::Unknown => {
            RecoveryAction::NotifyUserOnly
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mapping() {
        let table = StrategyTable::new();
        assert_eq!(table.strategy_for(ErrorKind::Network), RecoveryAction::RestartModule);
        assert_eq!(table.strategy_for(ErrorKind::Timeout), RecoveryAction::Retry);
        assert_eq!(table.strategy_for(ErrorKind::Memory), RecoveryAction::EnableFallback);
        assert_eq!(table.strategy_for(ErrorKind::Config), RecoveryAction::NotifyUserOnly);
    }

    #[test]
    fn test_last_registration_wins() {
        let mut table = StrategyTable::new();
        table.register(ErrorKind::Network, RecoveryAction::Retry);
        table.register(ErrorKind::Network, RecoveryAction::EscalateFatal);
        assert_eq!(table.strategy_for(ErrorKind::Network), RecoveryAction::EscalateFatal);
        // Other kinds untouched
        assert_eq!(table.strategy_for(ErrorKind::Hardware), RecoveryAction::RestartModule);
    }

    #[test]
    fn test_with_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert(ErrorKind::Unknown, RecoveryAction::EscalateFatal);
        let table = StrategyTable::with_overrides(&overrides);
        assert_eq!(table.strategy_for(ErrorKind::Unknown), RecoveryAction::EscalateFatal);
    }

    #[test]
    fn test_action_serde_names() {
        let json = serde_json::to_string(&RecoveryAction::RestartModule).unwrap();
        assert_eq!(json, "\"restart_module\"");
    }
}

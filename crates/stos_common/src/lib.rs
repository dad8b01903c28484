//! StosOS Common - fault handling and module recovery for StosOS.
//!
//! Feature modules report faults to the `RecoveryManager`, which classifies
//! them, picks a recovery action and drives the module's health state.
//! The health monitor and diagnostics cover the device itself.

pub mod classifier;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod history;
pub mod manager;
pub mod module;
pub mod monitor;
pub mod notify;
pub mod strategy;
pub mod tracker;
pub mod types;

pub use classifier::{classify, ErrorKind, Fault, FaultCategory, PatternDetector, Severity};
pub use config::StosConfig;
pub use diagnostics::{CheckStatus, DiagnosticReport, DiagnosticTools};
pub use error::{RecoveryError, Result};
pub use history::{BoundedLog, HistoryStore, JsonLinesStore};
pub use manager::{ErrorStatistics, RecoveryManager};
pub use module::{RecoverableModule, RestartResult};
pub use monitor::{HealthAlert, ResourceSample, SystemHealthMonitor};
pub use notify::{Notification, NotificationSink};
pub use strategy::{RecoveryAction, StrategyTable};
pub use tracker::{ModuleHealthState, ModuleHealthTracker, ModuleStatus};
pub use types::{ErrorRecord, OutcomeDetail, RecoveryOutcome};

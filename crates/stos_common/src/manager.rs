//! Module Recovery Manager
//!
//! Turns a fault reported by a feature module into a recovery decision:
//! classify, look up the strategy, consult the module's health, then run
//! the restart or fallback hook. Every entry point returns a
//! `RecoveryOutcome`; nothing raised by a module escapes to the caller.
//!
//! Recovery operations on one module are serialized by a per-module claim.
//! A second caller arriving while the claim is held gets a
//! "restart already in progress" outcome instead of waiting.

use crate::classifier::{classify, ErrorKind, Fault, PatternDetector, Severity};
use crate::classifier::{PATTERN_CRITICAL_COUNT, PATTERN_FREQUENT_COUNT, PATTERN_WARN_COUNT};
use crate::config::{RecoveryConfig, StosConfig};
use crate::error::{RecoveryError, Result};
use crate::history::{BoundedLog, HistoryStore};
use crate::module::{run_hook, RecoverableModule, RestartResult};
use crate::notify::{Notification, NotificationSink};
use crate::strategy::{RecoveryAction, StrategyTable};
use crate::tracker::{ModuleHealthState, ModuleHealthTracker, ModuleSlot, ModuleStatus, RestartRefusal};
use crate::types::{ErrorRecord, OutcomeDetail, RecoveryOutcome};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

struct RegisteredModule {
    module: Arc<dyn RecoverableModule>,
    dependencies: Vec<String>,
}

/// Error history summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    /// Records currently in the bounded history
    pub total_errors: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_module: BTreeMap<String, usize>,
    /// Cumulative counts keyed "kind:module", not bounded by the history
    pub pattern_counts: BTreeMap<String, u64>,
}

/// Recovery context for all feature modules
pub struct RecoveryManager {
    config: RecoveryConfig,
    strategies: StrategyTable,
    tracker: ModuleHealthTracker,
    modules: RwLock<HashMap<String, RegisteredModule>>,
    patterns: Mutex<PatternDetector>,
    pattern_counts: Mutex<BTreeMap<String, u64>>,
    errors: BoundedLog<ErrorRecord>,
    outcomes: BoundedLog<RecoveryOutcome>,
    error_store: Option<Arc<dyn HistoryStore<ErrorRecord>>>,
    outcome_store: Option<Arc<dyn HistoryStore<RecoveryOutcome>>>,
    sink: Arc<dyn NotificationSink>,
}

impl RecoveryManager {
    /// Create a manager with the default strategy table
    pub fn new(config: RecoveryConfig, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            patterns: Mutex::new(PatternDetector::new(config.pattern_window())),
            errors: BoundedLog::new(config.error_history_limit),
            outcomes: BoundedLog::new(config.outcome_history_limit),
            config,
            strategies: StrategyTable::new(),
            tracker: ModuleHealthTracker::new(),
            modules: RwLock::new(HashMap::new()),
            pattern_counts: Mutex::new(BTreeMap::new()),
            error_store: None,
            outcome_store: None,
            sink,
        }
    }

    /// Build from a loaded configuration, applying strategy overrides
    pub fn from_config(config: &StosConfig, sink: Arc<dyn NotificationSink>) -> anyhow::Result<Self> {
        let overrides = config.strategy_overrides()?;
        Ok(Self::new(config.recovery.clone(), sink)
            .with_strategies(StrategyTable::with_overrides(&overrides)))
    }

    pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
        self.strategies = strategies;
        self
    }

    /// Mirror every error record into an external store
    pub fn with_error_store(mut self, store: Arc<dyn HistoryStore<ErrorRecord>>) -> Self {
        self.error_store = Some(store);
        self
    }

    /// Mirror every recovery outcome into an external store
    pub fn with_outcome_store(mut self, store: Arc<dyn HistoryStore<RecoveryOutcome>>) -> Self {
        self.outcome_store = Some(store);
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn strategies(&self) -> &StrategyTable {
        &self.strategies
    }

    pub fn tracker(&self) -> &ModuleHealthTracker {
        &self.tracker
    }

    // ---- registration ------------------------------------------------

    pub fn register_module(&self, module: Arc<dyn RecoverableModule>) -> Result<()> {
        self.register_module_with_dependencies(module, &[])
    }

    /// Register a module that depends on other modules. After one of its
    /// dependencies is restored, a degraded dependent gets a restart.
    pub fn register_module_with_dependencies(
        &self,
        module: Arc<dyn RecoverableModule>,
        dependencies: &[&str],
    ) -> Result<()> {
        let module_id = module.module_id().to_string();

        // Held across both steps so a concurrent unregister of the same id
        // cannot split the tracker entry from the module entry
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        self.tracker.register(&module_id)?;
        modules.insert(
            module_id,
            RegisteredModule {
                module,
                dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            },
        );
        Ok(())
    }

    pub fn unregister_module(&self, module_id: &str) -> Result<()> {
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        self.tracker.unregister(module_id)?;
        modules.remove(module_id);
        Ok(())
    }

    fn module(&self, module_id: &str) -> Option<Arc<dyn RecoverableModule>> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(module_id)
            .map(|m| Arc::clone(&m.module))
    }

    fn dependents_of(&self, module_id: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, m)| m.dependencies.iter().any(|d| d == module_id))
            .map(|(id, _)| id.clone())
            .collect();
        dependents.sort();
        dependents
    }

    // ---- recovery entry points ---------------------------------------

    /// Handle a fault caught at a module boundary
    pub fn handle_failure(
        &self,
        module_id: &str,
        fault: impl Into<Fault>,
        context: &str,
    ) -> RecoveryOutcome {
        let fault = fault.into();
        let record = self.record_error(module_id, &fault, context);
        let action = self.strategies.strategy_for(record.kind);

        debug!(
            "Module {} fault classified as {}/{}, action {}",
            module_id, record.kind, record.severity, action
        );

        if !self.tracker.is_registered(module_id) {
            warn!("Fault reported for unregistered module {}", module_id);
            return self.finish(RecoveryOutcome::new(
                module_id,
                action,
                Some(false),
                OutcomeDetail::UnknownModule,
            ));
        }

        match action {
            RecoveryAction::Retry => {
                let outcome = RecoveryOutcome::new(module_id, action, None, OutcomeDetail::Deferred);
                self.finish(self.with_current_status(outcome))
            }
            RecoveryAction::RestartModule => self.restart(module_id, false),
            RecoveryAction::EnableFallback => self.fallback(module_id),
            RecoveryAction::NotifyUserOnly => {
                self.sink.notify(Notification::from_error(&record));
                let outcome = RecoveryOutcome::new(module_id, action, None, OutcomeDetail::Notified);
                self.finish(self.with_current_status(outcome))
            }
            RecoveryAction::EscalateFatal => {
                let mut notification = Notification::from_error(&record);
                notification.severity = Severity::Critical;
                self.sink.notify(notification);
                error!(
                    "Module {} fault escalated: {} ({})",
                    module_id, record.message, record.kind
                );
                let outcome =
                    RecoveryOutcome::new(module_id, action, Some(false), OutcomeDetail::Escalated);
                self.finish(self.with_current_status(outcome))
            }
        }
    }

    /// Explicit restart request. `force` skips the cooldown only.
    pub fn restart_module(&self, module_id: &str, force: bool) -> RecoveryOutcome {
        self.restart(module_id, force)
    }

    /// Explicit request to switch a module to reduced functionality
    pub fn enable_fallback(&self, module_id: &str) -> RecoveryOutcome {
        self.fallback(module_id)
    }

    // ---- management --------------------------------------------------

    /// Bring a module back from fallback or failed. Runs the module's
    /// `disable_fallback` hook first; the module stays put if it fails.
    pub fn reenable_module(&self, module_id: &str) -> Result<ModuleHealthState> {
        let slot = self.tracker.slot(module_id)?;
        let module = self
            .module(module_id)
            .ok_or_else(|| RecoveryError::UnknownModule(module_id.to_string()))?;
        let _claim = slot
            .try_claim()
            .ok_or_else(|| RecoveryError::ModuleBusy(module_id.to_string()))?;

        let status = slot.snapshot().status;
        if !status.is_terminal() {
            return Err(RecoveryError::InvalidTransition {
                module: module_id.to_string(),
                from: status,
                to: ModuleStatus::Healthy,
            });
        }

        if let Err(failure) = run_hook(module_id, self.config.hook_timeout(), move || {
            module.disable_fallback()
        }) {
            // Module stays where it was; the user can try again
            warn!("Failed to re-enable {}: {}", module_id, failure);
            return Err(RecoveryError::HookFailed {
                module: module_id.to_string(),
                reason: failure.to_string(),
            });
        }

        slot.reenable()?;
        info!("Module {} re-enabled", module_id);
        Ok(slot.snapshot())
    }

    /// Clear attempt count and cooldown. Refused while a recovery
    /// operation runs.
    pub fn reset_module(&self, module_id: &str) -> Result<()> {
        self.tracker.reset(module_id)
    }

    /// Count one successful operation. With `reset_after_successes`
    /// configured, reaching it resets the module's counters.
    pub fn record_success(&self, module_id: &str) -> Result<()> {
        let slot = self.tracker.slot(module_id)?;
        let _claim = slot
            .try_claim()
            .ok_or_else(|| RecoveryError::ModuleBusy(module_id.to_string()))?;
        let successes = slot.record_success();

        if let Some(threshold) = self.config.reset_after_successes {
            let state = slot.snapshot();
            let has_history = state.restart_attempts > 0 || state.status == ModuleStatus::Degraded;
            if successes >= threshold && has_history && !state.status.is_terminal() {
                slot.reset()?;
                info!(
                    "Module {} healthy for {} operations, recovery counters reset",
                    module_id, successes
                );
            }
        }
        Ok(())
    }

    /// A module reporting a non-fatal problem
    pub fn mark_degraded(&self, module_id: &str) -> Result<()> {
        let slot = self.tracker.slot(module_id)?;
        let _claim = slot
            .try_claim()
            .ok_or_else(|| RecoveryError::ModuleBusy(module_id.to_string()))?;
        if slot.snapshot().status == ModuleStatus::Degraded {
            return Ok(());
        }
        slot.transition(ModuleStatus::Degraded)?;
        warn!("Module {} marked degraded", module_id);
        Ok(())
    }

    // ---- queries -----------------------------------------------------

    pub fn module_health(&self, module_id: &str) -> Result<ModuleHealthState> {
        self.tracker.status(module_id)
    }

    pub fn all_module_health(&self) -> Vec<ModuleHealthState> {
        self.tracker.all()
    }

    /// Most recent error records, oldest first
    pub fn error_history(&self, limit: usize) -> Vec<ErrorRecord> {
        self.errors.last(limit)
    }

    /// Most recent recovery outcomes, optionally for one module
    pub fn recovery_history(&self, module_id: Option<&str>, limit: usize) -> Vec<RecoveryOutcome> {
        match module_id {
            Some(id) => self.outcomes.last_matching(limit, |o| o.module_id == id),
            None => self.outcomes.last(limit),
        }
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        let records = self.errors.snapshot();
        let mut stats = ErrorStatistics {
            total_errors: records.len(),
            pattern_counts: self
                .pattern_counts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            ..Default::default()
        };
        for record in &records {
            *stats.by_kind.entry(record.kind).or_insert(0) += 1;
            *stats.by_severity.entry(record.severity).or_insert(0) += 1;
            if !record.module_id.is_empty() {
                *stats.by_module.entry(record.module_id.clone()).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Clear error history, counters and pattern windows
    pub fn clear_history(&self) {
        self.errors.clear();
        self.pattern_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.patterns.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!("Error history cleared");
    }

    // ---- internals ---------------------------------------------------

    fn record_error(&self, module_id: &str, fault: &Fault, context: &str) -> ErrorRecord {
        let (kind, base_severity) = classify(fault, context);
        let now = Utc::now();

        let occurrences = self
            .patterns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observe(module_id, kind, now);
        let severity = PatternDetector::escalate(base_severity, occurrences);

        let mut record = ErrorRecord::new(module_id, kind, severity, fault.message.clone(), context)
            .with_occurrences(occurrences);
        record.timestamp = now;

        let key = format!("{}:{}", kind, module_id);
        let total = {
            let mut counts = self.pattern_counts.lock().unwrap_or_else(|e| e.into_inner());
            let count = counts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let line = format!(
            "Error in {}: {} (kind: {}, module: {})",
            if context.is_empty() { "unknown context" } else { context },
            record.message,
            kind,
            module_id
        );
        match severity {
            Severity::Critical => error!(escalated = occurrences > 1, "{}", line),
            Severity::High => error!("{}", line),
            Severity::Medium => warn!("{}", line),
            Severity::Low => info!("{}", line),
        }

        if occurrences == PATTERN_WARN_COUNT {
            warn!("Error pattern detected: {} occurred {} times", key, occurrences);
        } else if occurrences == PATTERN_FREQUENT_COUNT {
            error!("Frequent error pattern: {} occurred {} times", key, occurrences);
        } else if occurrences >= PATTERN_CRITICAL_COUNT {
            error!("Critical error pattern: {} occurred {} times", key, occurrences);
        }
        debug!("{} seen {} times in total", key, total);

        self.errors.push(record.clone());
        if let Some(store) = &self.error_store {
            if let Err(e) = store.append(&record) {
                warn!("Failed to persist error record: {:#}", e);
            }
        }
        record
    }

    fn with_current_status(&self, outcome: RecoveryOutcome) -> RecoveryOutcome {
        match self.tracker.status(&outcome.module_id) {
            Ok(state) => outcome.with_status(state.status),
            Err(_) => outcome,
        }
    }

    /// Log, store and surface an outcome
    fn finish(&self, outcome: RecoveryOutcome) -> RecoveryOutcome {
        match outcome.success {
            Some(false) => warn!("Recovery outcome: {}", outcome.message),
            _ => info!("Recovery outcome: {}", outcome.message),
        }

        if matches!(
            outcome.detail,
            OutcomeDetail::Restarted
                | OutcomeDetail::PartiallyRestarted
                | OutcomeDetail::RestartFailed { .. }
                | OutcomeDetail::AttemptsExhausted { .. }
                | OutcomeDetail::FallbackEngaged
                | OutcomeDetail::FallbackFailed
        ) {
            self.sink.notify(Notification::from_outcome(&outcome));
        }

        self.outcomes.push(outcome.clone());
        if let Some(store) = &self.outcome_store {
            if let Err(e) = store.append(&outcome) {
                warn!("Failed to persist recovery outcome: {:#}", e);
            }
        }
        outcome
    }

    fn restart(&self, module_id: &str, force: bool) -> RecoveryOutcome {
        let action = RecoveryAction::RestartModule;
        let (slot, module) = match (self.tracker.slot(module_id), self.module(module_id)) {
            (Ok(slot), Some(module)) => (slot, module),
            _ => {
                return self.finish(RecoveryOutcome::new(
                    module_id,
                    action,
                    Some(false),
                    OutcomeDetail::UnknownModule,
                ))
            }
        };

        let outcome = {
            let Some(_claim) = slot.try_claim() else {
                debug!("Restart of {} refused: operation in progress", module_id);
                let outcome = RecoveryOutcome::new(
                    module_id,
                    action,
                    Some(false),
                    OutcomeDetail::RestartInProgress,
                );
                return self.finish(outcome.with_status(ModuleStatus::Restarting));
            };
            self.restart_claimed(module_id, &slot, module, force)
        };

        let restored = outcome.detail == OutcomeDetail::Restarted;
        let outcome = self.finish(outcome);

        if restored {
            for dependent in self.dependents_of(module_id) {
                let degraded = self
                    .tracker
                    .status(&dependent)
                    .map(|s| s.status == ModuleStatus::Degraded)
                    .unwrap_or(false);
                if degraded {
                    info!(
                        "Dependency {} recovered, restarting dependent module {}",
                        module_id, dependent
                    );
                    self.restart(&dependent, false);
                }
            }
        }
        outcome
    }

    /// Restart with the module claim held
    fn restart_claimed(
        &self,
        module_id: &str,
        slot: &ModuleSlot,
        module: Arc<dyn RecoverableModule>,
        force: bool,
    ) -> RecoveryOutcome {
        let action = RecoveryAction::RestartModule;
        let max_attempts = self.config.max_restart_attempts;

        let state = slot.snapshot();
        if state.status.accepts_restart() && state.restart_attempts >= max_attempts {
            warn!(
                "Module {} has used {} of {} restart attempts, switching to fallback",
                module_id, state.restart_attempts, max_attempts
            );
            return self.engage_fallback(
                module_id,
                slot,
                module,
                action,
                OutcomeDetail::AttemptsExhausted {
                    attempts: state.restart_attempts,
                },
            );
        }

        match slot.begin_restart(self.config.restart_cooldown(), force, Utc::now()) {
            Ok(()) => {}
            Err(RestartRefusal::InProgress) => {
                return RecoveryOutcome::new(
                    module_id,
                    action,
                    Some(false),
                    OutcomeDetail::RestartInProgress,
                )
                .with_status(ModuleStatus::Restarting)
            }
            Err(RestartRefusal::CoolingDown(remaining)) => {
                debug!("Restart of {} refused: cooling down for {:?}", module_id, remaining);
                return RecoveryOutcome::new(
                    module_id,
                    action,
                    Some(false),
                    OutcomeDetail::CoolingDown {
                        remaining_ms: remaining.as_millis() as u64,
                    },
                )
                .with_status(state.status)
                .with_message(format!(
                    "{}: restart refused, cooling down for {}s",
                    module_id,
                    remaining.as_secs()
                ));
            }
            Err(RestartRefusal::Unavailable(status)) => {
                return RecoveryOutcome::new(
                    module_id,
                    action,
                    Some(false),
                    OutcomeDetail::Unavailable { status },
                )
                .with_status(status)
            }
        }

        info!("Restarting module {}", module_id);
        let hook_module = Arc::clone(&module);
        let result = run_hook(module_id, self.config.hook_timeout(), move || hook_module.restart());
        let attempts = slot.record_attempt();

        match result {
            Ok(RestartResult::Restored) => {
                self.settle(slot, ModuleStatus::Healthy);
                info!("Module {} restarted successfully", module_id);
                RecoveryOutcome::new(module_id, action, Some(true), OutcomeDetail::Restarted)
                    .with_status(ModuleStatus::Healthy)
            }
            Ok(RestartResult::Partial) => {
                self.settle(slot, ModuleStatus::Degraded);
                warn!("Module {} restarted with reduced functionality", module_id);
                RecoveryOutcome::new(module_id, action, Some(true), OutcomeDetail::PartiallyRestarted)
                    .with_status(ModuleStatus::Degraded)
            }
            Err(failure) => {
                error!(
                    "Module {} restart failed (attempt {}/{}): {}",
                    module_id, attempts, max_attempts, failure
                );
                if attempts >= max_attempts {
                    self.engage_fallback(
                        module_id,
                        slot,
                        module,
                        action,
                        OutcomeDetail::AttemptsExhausted { attempts },
                    )
                } else {
                    self.settle(slot, ModuleStatus::Degraded);
                    RecoveryOutcome::new(
                        module_id,
                        action,
                        Some(false),
                        OutcomeDetail::RestartFailed { attempts },
                    )
                    .with_status(ModuleStatus::Degraded)
                    .with_message(format!("{}: restart failed: {}", module_id, failure))
                }
            }
        }
    }

    fn fallback(&self, module_id: &str) -> RecoveryOutcome {
        let action = RecoveryAction::EnableFallback;
        let (slot, module) = match (self.tracker.slot(module_id), self.module(module_id)) {
            (Ok(slot), Some(module)) => (slot, module),
            _ => {
                return self.finish(RecoveryOutcome::new(
                    module_id,
                    action,
                    Some(false),
                    OutcomeDetail::UnknownModule,
                ))
            }
        };

        let outcome = {
            let Some(_claim) = slot.try_claim() else {
                let outcome = RecoveryOutcome::new(
                    module_id,
                    action,
                    Some(false),
                    OutcomeDetail::RestartInProgress,
                );
                return self.finish(outcome.with_status(ModuleStatus::Restarting));
            };

            let status = slot.snapshot().status;
            if status.is_terminal() || status == ModuleStatus::Restarting {
                RecoveryOutcome::new(
                    module_id,
                    action,
                    Some(false),
                    OutcomeDetail::Unavailable { status },
                )
                .with_status(status)
            } else {
                self.engage_fallback(module_id, &slot, module, action, OutcomeDetail::FallbackEngaged)
            }
        };
        self.finish(outcome)
    }

    /// Move to fallback and run the fallback hook. A failing hook leaves the
    /// module failed and escalates.
    fn engage_fallback(
        &self,
        module_id: &str,
        slot: &ModuleSlot,
        module: Arc<dyn RecoverableModule>,
        action: RecoveryAction,
        detail: OutcomeDetail,
    ) -> RecoveryOutcome {
        self.settle(slot, ModuleStatus::Fallback);

        match run_hook(module_id, self.config.hook_timeout(), move || module.enable_fallback()) {
            Ok(()) => {
                warn!("Fallback mode enabled for module {}", module_id);
                let success = match detail {
                    OutcomeDetail::FallbackEngaged => Some(true),
                    _ => Some(false),
                };
                RecoveryOutcome::new(module_id, action, success, detail)
                    .with_status(ModuleStatus::Fallback)
            }
            Err(failure) => {
                self.settle(slot, ModuleStatus::Failed);
                error!("Fallback for module {} failed: {}", module_id, failure);
                RecoveryOutcome::new(
                    module_id,
                    RecoveryAction::EscalateFatal,
                    Some(false),
                    OutcomeDetail::FallbackFailed,
                )
                .with_status(ModuleStatus::Failed)
                .with_message(format!("{}: fallback failed: {}", module_id, failure))
            }
        }
    }

    /// Transition that the manager has already proven legal
    fn settle(&self, slot: &ModuleSlot, to: ModuleStatus) {
        if let Err(e) = slot.transition(to) {
            error!("Unexpected state transition refused: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FaultCategory;
    use crate::notify::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubModule {
        id: &'static str,
        restart_ok: bool,
        fallback_ok: bool,
        restarts: AtomicUsize,
        fallbacks: AtomicUsize,
    }

    impl StubModule {
        fn new(id: &'static str, restart_ok: bool, fallback_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                id,
                restart_ok,
                fallback_ok,
                restarts: AtomicUsize::new(0),
                fallbacks: AtomicUsize::new(0),
            })
        }
    }

    impl RecoverableModule for StubModule {
        fn module_id(&self) -> &str {
            self.id
        }

        fn restart(&self) -> anyhow::Result<RestartResult> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            if self.restart_ok {
                Ok(RestartResult::Restored)
            } else {
                anyhow::bail!("restart refused")
            }
        }

        fn enable_fallback(&self) -> anyhow::Result<()> {
            self.fallbacks.fetch_add(1, Ordering::SeqCst);
            if self.fallback_ok {
                Ok(())
            } else {
                anyhow::bail!("fallback unavailable")
            }
        }
    }

    fn config(cooldown_secs: u64) -> RecoveryConfig {
        RecoveryConfig {
            restart_cooldown_secs: cooldown_secs,
            hook_timeout_secs: 2,
            ..Default::default()
        }
    }

    fn network_fault() -> Fault {
        Fault::new(FaultCategory::Connection, "connection reset")
    }

    #[test]
    fn test_retry_is_deferred_to_caller() {
        let manager = RecoveryManager::new(config(0), Arc::new(MemorySink::new()));
        let module = StubModule::new("spotify", true, true);
        manager.register_module(module.clone()).unwrap();

        let outcome = manager.handle_failure(
            "spotify",
            Fault::new(FaultCategory::Timeout, "slow"),
            "search",
        );
        assert_eq!(outcome.action, RecoveryAction::Retry);
        assert_eq!(outcome.success, None);
        assert_eq!(outcome.detail, OutcomeDetail::Deferred);
        assert_eq!(module.restarts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_module_outcome() {
        let manager = RecoveryManager::new(config(0), Arc::new(MemorySink::new()));
        let outcome = manager.handle_failure("ghost", network_fault(), "");
        assert_eq!(outcome.detail, OutcomeDetail::UnknownModule);
        assert_eq!(outcome.success, Some(false));
        // The fault is still on record
        assert_eq!(manager.error_history(10).len(), 1);
    }

    #[test]
    fn test_cooldown_rejects_without_counting() {
        let manager = RecoveryManager::new(config(300), Arc::new(MemorySink::new()));
        let module = StubModule::new("calendar", false, true);
        manager.register_module(module.clone()).unwrap();

        let first = manager.handle_failure("calendar", network_fault(), "sync");
        assert_eq!(first.detail, OutcomeDetail::RestartFailed { attempts: 1 });

        let second = manager.handle_failure("calendar", network_fault(), "sync");
        assert!(second.is_cooling_down());
        assert_eq!(second.success, Some(false));
        assert_eq!(manager.module_health("calendar").unwrap().restart_attempts, 1);
        assert_eq!(module.restarts.load(Ordering::SeqCst), 1);

        // force skips the cooldown
        let forced = manager.restart_module("calendar", true);
        assert_eq!(forced.detail, OutcomeDetail::RestartFailed { attempts: 2 });
    }

    #[test]
    fn test_enable_fallback_failure_escalates() {
        let sink = Arc::new(MemorySink::new());
        let manager = RecoveryManager::new(config(0), sink.clone());
        let module = StubModule::new("smart_home", true, false);
        manager.register_module(module.clone()).unwrap();

        let outcome = manager.enable_fallback("smart_home");
        assert_eq!(outcome.action, RecoveryAction::EscalateFatal);
        assert_eq!(outcome.detail, OutcomeDetail::FallbackFailed);
        assert_eq!(outcome.status_after, Some(ModuleStatus::Failed));
        assert!(sink
            .received()
            .iter()
            .any(|n| n.severity == Severity::Critical));
    }

    #[test]
    fn test_memory_fault_enables_fallback() {
        let manager = RecoveryManager::new(config(0), Arc::new(MemorySink::new()));
        let module = StubModule::new("voice", true, true);
        manager.register_module(module.clone()).unwrap();

        let outcome = manager.handle_failure(
            "voice",
            Fault::new(FaultCategory::OutOfMemory, "model too large"),
            "wake word",
        );
        assert_eq!(outcome.action, RecoveryAction::EnableFallback);
        assert_eq!(outcome.success, Some(true));
        assert_eq!(outcome.status_after, Some(ModuleStatus::Fallback));
        assert_eq!(module.fallbacks.load(Ordering::SeqCst), 1);

        // Fallback is terminal: no second fallback hook call
        let again = manager.enable_fallback("voice");
        assert_eq!(
            again.detail,
            OutcomeDetail::Unavailable {
                status: ModuleStatus::Fallback
            }
        );
        assert_eq!(module.fallbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_escalate_fatal_does_not_touch_state() {
        let mut strategies = StrategyTable::new();
        strategies.register(ErrorKind::Config, RecoveryAction::EscalateFatal);
        let sink = Arc::new(MemorySink::new());
        let manager = RecoveryManager::new(config(0), sink.clone()).with_strategies(strategies);
        manager
            .register_module(StubModule::new("tasks", true, true))
            .unwrap();

        let outcome = manager.handle_failure(
            "tasks",
            Fault::new(FaultCategory::Config, "missing database path"),
            "startup",
        );
        assert_eq!(outcome.detail, OutcomeDetail::Escalated);
        assert_eq!(outcome.success, Some(false));
        assert_eq!(outcome.status_after, Some(ModuleStatus::Healthy));
        assert_eq!(sink.received().len(), 1);
        assert_eq!(sink.received()[0].severity, Severity::Critical);
    }

    #[test]
    fn test_notify_only() {
        let sink = Arc::new(MemorySink::new());
        let manager = RecoveryManager::new(config(0), sink.clone());
        manager
            .register_module(StubModule::new("ideas", true, true))
            .unwrap();

        let outcome = manager.handle_failure(
            "ideas",
            Fault::new(FaultCategory::PermissionDenied, "cannot write"),
            "export",
        );
        assert_eq!(outcome.action, RecoveryAction::NotifyUserOnly);
        assert_eq!(outcome.detail, OutcomeDetail::Notified);
        assert_eq!(sink.received().len(), 1);
    }

    #[test]
    fn test_reenable_from_fallback() {
        let manager = RecoveryManager::new(config(0), Arc::new(MemorySink::new()));
        let module = StubModule::new("study", true, true);
        manager.register_module(module.clone()).unwrap();

        manager.enable_fallback("study");
        let state = manager.reenable_module("study").unwrap();
        assert_eq!(state.status, ModuleStatus::Healthy);
        assert_eq!(state.restart_attempts, 0);

        // Not in a terminal state any more
        assert!(manager.reenable_module("study").is_err());
    }

    #[test]
    fn test_record_success_resets_after_threshold() {
        let cfg = RecoveryConfig {
            reset_after_successes: Some(3),
            ..config(0)
        };
        let manager = RecoveryManager::new(cfg, Arc::new(MemorySink::new()));
        manager
            .register_module(StubModule::new("dashboard", false, true))
            .unwrap();

        manager.handle_failure("dashboard", network_fault(), "");
        assert_eq!(manager.module_health("dashboard").unwrap().restart_attempts, 1);

        manager.record_success("dashboard").unwrap();
        manager.record_success("dashboard").unwrap();
        assert_eq!(manager.module_health("dashboard").unwrap().restart_attempts, 1);

        manager.record_success("dashboard").unwrap();
        let state = manager.module_health("dashboard").unwrap();
        assert_eq!(state.restart_attempts, 0);
        assert_eq!(state.status, ModuleStatus::Healthy);
    }

    #[test]
    fn test_register_churn_keeps_entries_paired() {
        let manager = Arc::new(RecoveryManager::new(config(0), Arc::new(MemorySink::new())));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let _ = manager.register_module(StubModule::new("ideas", true, true));
                        let _ = manager.unregister_module("ideas");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let tracked = manager.tracker().is_registered("ideas");
        assert_eq!(tracked, manager.module("ideas").is_some());
        if tracked {
            let outcome = manager.restart_module("ideas", true);
            assert_ne!(outcome.detail, OutcomeDetail::UnknownModule);
        }
    }

    #[test]
    fn test_mark_degraded() {
        let manager = RecoveryManager::new(config(0), Arc::new(MemorySink::new()));
        manager
            .register_module(StubModule::new("calendar", true, true))
            .unwrap();

        manager.mark_degraded("calendar").unwrap();
        manager.mark_degraded("calendar").unwrap();
        assert_eq!(
            manager.module_health("calendar").unwrap().status,
            ModuleStatus::Degraded
        );
        assert!(manager.mark_degraded("ghost").is_err());
    }

    #[test]
    fn test_error_statistics() {
        let manager = RecoveryManager::new(config(0), Arc::new(MemorySink::new()));
        manager.handle_failure("spotify", Fault::new(FaultCategory::Timeout, "a"), "");
        manager.handle_failure("spotify", Fault::new(FaultCategory::Timeout, "b"), "");
        manager.handle_failure("calendar", network_fault(), "");

        let stats = manager.error_statistics();
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.by_kind.get(&ErrorKind::Timeout), Some(&2));
        assert_eq!(stats.by_module.get("calendar"), Some(&1));
        assert_eq!(stats.pattern_counts.get("timeout:spotify"), Some(&2));

        manager.clear_history();
        assert_eq!(manager.error_statistics().total_errors, 0);
        assert!(manager.error_statistics().pattern_counts.is_empty());
    }

    #[test]
    fn test_repeated_faults_escalate_severity() {
        let manager = RecoveryManager::new(config(0), Arc::new(MemorySink::new()));
        for _ in 0..5 {
            manager.handle_failure("spotify", Fault::new(FaultCategory::Timeout, "slow"), "");
        }
        let history = manager.error_history(5);
        assert_eq!(history[0].severity, Severity::Low);
        assert_eq!(history[4].occurrences, 5);
        assert_eq!(history[4].severity, Severity::Medium);
    }

    #[test]
    fn test_error_history_is_bounded() {
        let cfg = RecoveryConfig {
            error_history_limit: 4,
            ..config(0)
        };
        let manager = RecoveryManager::new(cfg, Arc::new(MemorySink::new()));
        for i in 0..10 {
            manager.handle_failure("x", Fault::other(format!("fault {}", i)), "");
        }
        let history = manager.error_history(100);
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].message, "fault 6");
    }
}

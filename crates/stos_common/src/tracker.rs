//! Module Health Tracker
//!
//! Per-module health state: status, restart attempts, cooldown. One entry per
//! registered module, kept until the module is unregistered. Only the
//! recovery manager drives status transitions.
//!
//! State machine:
//!
//! ```text
//! healthy ──► restarting ──► healthy | degraded
//! degraded ─► restarting
//! restarting ─► fallback (attempts exhausted) ─► failed (fallback failed)
//! fallback | failed ──► healthy (explicit re-enable only)
//! ```

use crate::error::{RecoveryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::Duration;
use tracing::{debug, info};

/// Status changes kept per module
const TRANSITION_HISTORY_LIMIT: usize = 64;

/// Module operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Healthy,
    Degraded,
    Restarting,
    Fallback,
    Failed,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Restarting => "restarting",
            Self::Fallback => "fallback",
            Self::Failed => "failed",
        }
    }

    /// Only healthy and degraded modules may enter `restarting`
    pub fn accepts_restart(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Fallback and failed stay put until an explicit re-enable
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fallback | Self::Failed)
    }

    pub fn can_transition_to(&self, to: ModuleStatus) -> bool {
        use ModuleStatus::*;
        matches!(
            (self, to),
            (Healthy, Degraded)
                | (Healthy, Restarting)
                | (Healthy, Fallback)
                | (Degraded, Healthy)
                | (Degraded, Restarting)
                | (Degraded, Fallback)
                | (Restarting, Healthy)
                | (Restarting, Degraded)
                | (Restarting, Fallback)
                | (Fallback, Failed)
                | (Fallback, Healthy)
                | (Failed, Healthy)
        )
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of one module's health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleHealthState {
    pub module_id: String,
    pub status: ModuleStatus,
    pub restart_attempts: u32,
    pub last_restart: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Successful operations since the last failure
    pub consecutive_successes: u32,
}

impl ModuleHealthState {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            status: ModuleStatus::Healthy,
            restart_attempts: 0,
            last_restart: None,
            cooldown_until: None,
            consecutive_successes: 0,
        }
    }

    /// Time left before another restart is allowed
    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let until = self.cooldown_until?;
        if until > now {
            (until - now).to_std().ok()
        } else {
            None
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_remaining(now).is_some()
    }
}

/// One recorded status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: ModuleStatus,
    pub to: ModuleStatus,
    pub at: DateTime<Utc>,
}

/// Why a restart could not start
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RestartRefusal {
    InProgress,
    CoolingDown(Duration),
    Unavailable(ModuleStatus),
}

/// Per-module entry
#[derive(Debug)]
pub(crate) struct ModuleSlot {
    state: Mutex<ModuleHealthState>,
    transitions: Mutex<VecDeque<StatusChange>>,
    /// Held for the whole of a restart or fallback operation
    op_lock: Mutex<()>,
}

impl ModuleSlot {
    fn new(module_id: &str) -> Self {
        Self {
            state: Mutex::new(ModuleHealthState::new(module_id)),
            transitions: Mutex::new(VecDeque::new()),
            op_lock: Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ModuleHealthState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn snapshot(&self) -> ModuleHealthState {
        self.state().clone()
    }

    /// Claim the module for a recovery operation without blocking
    pub(crate) fn try_claim(&self) -> Option<MutexGuard<'_, ()>> {
        match self.op_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
        }
    }

    pub(crate) fn transition(&self, to: ModuleStatus) -> Result<ModuleStatus> {
        let mut state = self.state();
        self.apply_transition(&mut state, to)
    }

    fn apply_transition(&self, state: &mut ModuleHealthState, to: ModuleStatus) -> Result<ModuleStatus> {
        let from = state.status;
        if !from.can_transition_to(to) {
            return Err(RecoveryError::InvalidTransition {
                module: state.module_id.clone(),
                from,
                to,
            });
        }
        state.status = to;
        debug!("Module {} status {} -> {}", state.module_id, from, to);

        let mut transitions = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
        transitions.push_back(StatusChange {
            from,
            to,
            at: Utc::now(),
        });
        while transitions.len() > TRANSITION_HISTORY_LIMIT {
            transitions.pop_front();
        }
        Ok(from)
    }

    /// Check eligibility and enter `restarting` in one step
    pub(crate) fn begin_restart(
        &self,
        cooldown: Duration,
        force: bool,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), RestartRefusal> {
        let mut state = self.state();

        if state.status == ModuleStatus::Restarting {
            return Err(RestartRefusal::InProgress);
        }
        if !state.status.accepts_restart() {
            return Err(RestartRefusal::Unavailable(state.status));
        }
        if !force {
            if let Some(remaining) = state.cooldown_remaining(now) {
                return Err(RestartRefusal::CoolingDown(remaining));
            }
        }

        self.apply_transition(&mut state, ModuleStatus::Restarting)
            .map_err(|_| RestartRefusal::Unavailable(state.status))?;
        state.last_restart = Some(now);
        state.cooldown_until = chrono::Duration::from_std(cooldown)
            .ok()
            .and_then(|d| now.checked_add_signed(d));
        Ok(())
    }

    pub(crate) fn record_attempt(&self) -> u32 {
        let mut state = self.state();
        state.restart_attempts = state.restart_attempts.saturating_add(1);
        state.consecutive_successes = 0;
        state.restart_attempts
    }

    pub(crate) fn record_success(&self) -> u32 {
        let mut state = self.state();
        state.consecutive_successes = state.consecutive_successes.saturating_add(1);
        state.consecutive_successes
    }

    /// Clear counters and cooldown; a degraded module becomes healthy
    pub(crate) fn reset(&self) -> Result<()> {
        let mut state = self.state();
        if state.status == ModuleStatus::Degraded {
            self.apply_transition(&mut state, ModuleStatus::Healthy)?;
        }
        state.restart_attempts = 0;
        state.consecutive_successes = 0;
        state.cooldown_until = None;
        Ok(())
    }

    /// Leave fallback or failed and start over as healthy
    pub(crate) fn reenable(&self) -> Result<()> {
        let mut state = self.state();
        self.apply_transition(&mut state, ModuleStatus::Healthy)?;
        state.restart_attempts = 0;
        state.consecutive_successes = 0;
        state.cooldown_until = None;
        Ok(())
    }

    fn transitions(&self) -> Vec<StatusChange> {
        self.transitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Registry of module health, keyed by module id
#[derive(Debug, Default)]
pub struct ModuleHealthTracker {
    modules: RwLock<HashMap<String, Arc<ModuleSlot>>>,
}

impl ModuleHealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a module as healthy
    pub fn register(&self, module_id: &str) -> Result<()> {
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        if modules.contains_key(module_id) {
            return Err(RecoveryError::AlreadyRegistered(module_id.to_string()));
        }
        modules.insert(module_id.to_string(), Arc::new(ModuleSlot::new(module_id)));
        info!("Registered module {} for recovery management", module_id);
        Ok(())
    }

    /// Stop tracking a module. Refused while a recovery operation runs.
    pub fn unregister(&self, module_id: &str) -> Result<()> {
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        let slot = modules
            .get(module_id)
            .cloned()
            .ok_or_else(|| RecoveryError::UnknownModule(module_id.to_string()))?;
        let _claim = slot
            .try_claim()
            .ok_or_else(|| RecoveryError::ModuleBusy(module_id.to_string()))?;
        modules.remove(module_id);
        info!("Unregistered module {}", module_id);
        Ok(())
    }

    /// Count one restart attempt; returns the new count
    pub fn record_attempt(&self, module_id: &str) -> Result<u32> {
        Ok(self.slot(module_id)?.record_attempt())
    }

    /// Read-only snapshot
    pub fn status(&self, module_id: &str) -> Result<ModuleHealthState> {
        Ok(self.slot(module_id)?.snapshot())
    }

    /// Clear attempt count and cooldown after a sustained healthy period.
    /// Refused while a recovery operation runs.
    pub fn reset(&self, module_id: &str) -> Result<()> {
        let slot = self.slot(module_id)?;
        let _claim = slot
            .try_claim()
            .ok_or_else(|| RecoveryError::ModuleBusy(module_id.to_string()))?;
        slot.reset()?;
        info!("Module {} recovery counters reset", module_id);
        Ok(())
    }

    pub fn is_registered(&self, module_id: &str) -> bool {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(module_id)
    }

    pub fn module_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Snapshots of every registered module, sorted by id
    pub fn all(&self) -> Vec<ModuleHealthState> {
        let mut states: Vec<ModuleHealthState> = self
            .modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        states.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        states
    }

    /// Recent status changes, oldest first
    pub fn transitions(&self, module_id: &str) -> Result<Vec<StatusChange>> {
        Ok(self.slot(module_id)?.transitions())
    }

    pub(crate) fn slot(&self, module_id: &str) -> Result<Arc<ModuleSlot>> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(module_id)
            .cloned()
            .ok_or_else(|| RecoveryError::UnknownModule(module_id.to_string()))
    }
}

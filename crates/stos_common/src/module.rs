//! Capability contract for recoverable feature modules
//!
//! Every feature module (calendar, tasks, spotify, ...) implements
//! `RecoverableModule` so the recovery manager can restart it or drop it to
//! reduced functionality without knowing anything else about it.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// How far a restart got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartResult {
    /// Module is fully functional again
    Restored,
    /// Module came back with some features unavailable
    Partial,
}

/// A module the recovery manager can restart or degrade
pub trait RecoverableModule: Send + Sync {
    /// Stable module identifier
    fn module_id(&self) -> &str;

    /// Restart the module. Must be safe to call again after a failed attempt.
    fn restart(&self) -> Result<RestartResult>;

    /// Switch to reduced functionality. Called at most once per fallback
    /// transition.
    fn enable_fallback(&self) -> Result<()>;

    /// Leave reduced functionality on an explicit re-enable
    fn disable_fallback(&self) -> Result<()> {
        self.restart().map(|_| ())
    }
}

/// Why a hook did not succeed
#[derive(Debug)]
pub enum HookFailure {
    Error(anyhow::Error),
    Panicked(String),
    TimedOut(Duration),
}

impl std::fmt::Display for HookFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookFailure::Error(e) => write!(f, "{:#}", e),
            HookFailure::Panicked(msg) => write!(f, "hook panicked: {}", msg),
            HookFailure::TimedOut(limit) => write!(f, "hook timed out after {:?}", limit),
        }
    }
}

/// Run a hook on its own thread and wait at most `timeout` for it.
///
/// A hook that overruns keeps running detached; its late result is dropped.
pub fn run_hook<T, F>(name: &str, timeout: Duration, hook: F) -> std::result::Result<T, HookFailure>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    let spawned = thread::Builder::new()
        .name(format!("hook-{}", name))
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(hook));
            let _ = tx.send(result);
        });

    if let Err(e) = spawned {
        return Err(HookFailure::Error(anyhow::Error::from(e).context("Failed to spawn hook thread")));
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(HookFailure::Error(e)),
        Ok(Err(payload)) => Err(HookFailure::Panicked(
            crate::classifier::Fault::from_panic(payload.as_ref()).message,
        )),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(HookFailure::TimedOut(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(HookFailure::Panicked("hook thread exited without a result".to_string()))
        }
    }
}

//! StosOS Daemon - fault recovery and device health
//!
//! Owns the recovery manager, samples device health on a timer and runs
//! startup diagnostics. Notifications are written to the log.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stos_common::diagnostics::{CheckStatus, DiagnosticTools};
use stos_common::history::JsonLinesStore;
use stos_common::monitor::{SysinfoSampler, SystemHealthMonitor};
use stos_common::notify::{ChannelSink, NotificationSink, TracingSink};
use stos_common::{ErrorRecord, RecoveryManager, RecoveryOutcome, StosConfig};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Where error and outcome logs are kept: ~/.local/share/stosos
fn state_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("stosos"))
}

fn build_manager(config: &StosConfig, sink: Arc<dyn NotificationSink>) -> Result<RecoveryManager> {
    let manager = RecoveryManager::from_config(config, sink)?;

    let Some(dir) = state_dir() else {
        warn!("No data directory available, recovery history kept in memory only");
        return Ok(manager);
    };

    match open_stores(&dir, config.recovery.persisted_history_limit) {
        Ok((errors, outcomes)) => {
            info!("Recovery history persisted under {}", dir.display());
            Ok(manager
                .with_error_store(Arc::new(errors))
                .with_outcome_store(Arc::new(outcomes)))
        }
        Err(e) => {
            warn!("Recovery history kept in memory only: {:#}", e);
            Ok(manager)
        }
    }
}

fn open_stores(
    dir: &Path,
    limit: usize,
) -> Result<(JsonLinesStore<ErrorRecord>, JsonLinesStore<RecoveryOutcome>)> {
    let errors = JsonLinesStore::open_with_limit(dir.join("errors.jsonl"), limit)?;
    let outcomes = JsonLinesStore::open_with_limit(dir.join("outcomes.jsonl"), limit)?;
    Ok((errors, outcomes))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("StosOS daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let explicit = std::env::var_os("STOSOS_CONFIG").map(PathBuf::from);
    let config = StosConfig::load(explicit.as_deref())?;

    // Notifications from every producer end up in one log consumer
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn NotificationSink> = Arc::new(ChannelSink::new(notify_tx));
    let notifier = tokio::spawn(async move {
        let log = TracingSink;
        while let Some(notification) = notify_rx.recv().await {
            log.notify(notification);
        }
    });

    let manager = Arc::new(build_manager(&config, Arc::clone(&sink))?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (alert_tx, mut alert_rx) = mpsc::unbounded_channel();
    let monitor = Arc::new(SystemHealthMonitor::new(config.monitor.clone()));
    let sampler = SysinfoSampler::new(config.monitor.disk_path.clone());
    let monitor_task = tokio::spawn(Arc::clone(&monitor).run(sampler, alert_tx, shutdown_rx));

    let alert_sink = Arc::clone(&sink);
    let alerts_task = tokio::spawn(async move {
        while let Some(alert) = alert_rx.recv().await {
            alert_sink.notify(alert.to_notification());
        }
    });

    // Checks block on TCP connects
    let diagnostics = config.diagnostics.clone();
    let report =
        tokio::task::spawn_blocking(move || DiagnosticTools::with_defaults(&diagnostics).run_all())
            .await?;
    match report.to_json() {
        Ok(json) => debug!("Startup diagnostics:\n{}", json),
        Err(e) => warn!("{:#}", e),
    }
    if report.overall >= CheckStatus::Fail {
        for entry in report.entries.iter().filter(|e| e.status >= CheckStatus::Fail) {
            warn!("Startup check {} {}: {}", entry.name, entry.status, entry.message);
        }
    }

    info!(
        "StosOS daemon ready ({} modules under recovery management)",
        manager.all_module_health().len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down gracefully");

    let _ = shutdown_tx.send(true);
    monitor_task.await?;
    alerts_task.await?;

    info!(
        "Final module health: {}",
        serde_json::to_string(&manager.all_module_health())?
    );
    if let Some(sample) = monitor.latest_sample() {
        debug!("Last resource sample: {}", serde_json::to_string(&sample)?);
    }

    // Closing every sender ends the notifier
    drop(manager);
    drop(sink);
    notifier.await?;

    Ok(())
}

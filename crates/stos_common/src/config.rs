//! StosOS recovery configuration
//!
//! Thresholds for restart policy, health monitoring and diagnostics.
//! Config file: ~/.config/stosos/config.toml or /etc/stosos/config.toml
//! Read once at startup; there is no hot reload.

use crate::classifier::ErrorKind;
use crate::strategy::RecoveryAction;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Restart policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Restart attempts before a module is moved to fallback
    pub max_restart_attempts: u32,

    /// Minimum interval between restarts of the same module (seconds)
    pub restart_cooldown_secs: u64,

    /// Upper bound on a single restart or fallback hook (seconds)
    pub hook_timeout_secs: u64,

    /// Error records kept in memory
    pub error_history_limit: usize,

    /// Recovery outcomes kept in memory
    pub outcome_history_limit: usize,

    /// Records kept in each on-disk history file
    pub persisted_history_limit: usize,

    /// Window for repeated-fault escalation (seconds)
    pub pattern_window_secs: u64,

    /// Consecutive successes that reset a module's attempt count.
    /// Unset means the caller resets explicitly.
    pub reset_after_successes: Option<u32>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 3,
            restart_cooldown_secs: 300,
            hook_timeout_secs: 10,
            error_history_limit: 100,
            outcome_history_limit: 1000,
            persisted_history_limit: 5000,
            pattern_window_secs: 300,
            reset_after_successes: None,
        }
    }
}

impl RecoveryConfig {
    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn pattern_window(&self) -> Duration {
        Duration::from_secs(self.pattern_window_secs)
    }
}

/// Warning and critical levels for one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl MetricThresholds {
    pub fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }
}

/// System Health Monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling interval (seconds)
    pub interval_secs: u64,
    pub alert_history_limit: usize,
    pub sample_history_limit: usize,
    /// Mount point whose usage is sampled
    pub disk_path: PathBuf,
    pub cpu: MetricThresholds,
    pub memory: MetricThresholds,
    pub disk: MetricThresholds,
    /// Degrees Celsius
    pub temperature: MetricThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            alert_history_limit: 100,
            // One hour at the default interval
            sample_history_limit: 720,
            disk_path: PathBuf::from("/"),
            cpu: MetricThresholds::new(75.0, 90.0),
            memory: MetricThresholds::new(80.0, 90.0),
            disk: MetricThresholds::new(85.0, 95.0),
            temperature: MetricThresholds::new(70.0, 80.0),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// A named endpoint checked by the service diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    /// host:port
    pub address: String,
}

/// Diagnostic Tools settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// host:port pairs; connectivity passes if any is reachable
    pub connectivity_targets: Vec<String>,
    pub connect_timeout_ms: u64,
    pub disk_path: PathBuf,
    pub min_free_disk_mb: u64,
    pub min_available_memory_mb: u64,
    pub services: Vec<ServiceEndpoint>,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            connectivity_targets: vec!["1.1.1.1:53".to_string(), "8.8.8.8:53".to_string()],
            connect_timeout_ms: 2000,
            disk_path: PathBuf::from("/"),
            min_free_disk_mb: 512,
            min_available_memory_mb: 128,
            services: vec![
                ServiceEndpoint {
                    name: "google_calendar".to_string(),
                    address: "www.googleapis.com:443".to_string(),
                },
                ServiceEndpoint {
                    name: "spotify".to_string(),
                    address: "api.spotify.com:443".to_string(),
                },
            ],
        }
    }
}

impl DiagnosticsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Main StosOS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StosConfig {
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Per-kind recovery action overrides, keyed by error kind name
    #[serde(default)]
    pub strategies: BTreeMap<String, RecoveryAction>,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

impl StosConfig {
    /// Get default user config path: ~/.config/stosos/config.toml
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("stosos").join("config.toml"))
    }

    /// Get system config path: /etc/stosos/config.toml
    pub fn system_config_path() -> PathBuf {
        PathBuf::from("/etc/stosos/config.toml")
    }

    /// Load configuration
    ///
    /// Priority:
    /// 1. Explicit path, if given
    /// 2. User config (~/.config/stosos/config.toml)
    /// 3. System config (/etc/stosos/config.toml)
    /// 4. Defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                return Self::load_from(&user_path);
            }
        }

        let system_path = Self::system_config_path();
        if system_path.exists() {
            return Self::load_from(&system_path);
        }

        debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load and validate a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: StosConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Strategy overrides with their kind names resolved
    pub fn strategy_overrides(&self) -> Result<BTreeMap<ErrorKind, RecoveryAction>> {
        self.strategies
            .iter()
            .map(|(name, action)| {
                let kind = name
                    .parse::<ErrorKind>()
                    .map_err(|_| anyhow::anyhow!("strategies: unknown error kind '{}'", name))?;
                Ok((kind, *action))
            })
            .collect()
    }

    /// Reject threshold combinations the monitor and manager cannot honor
    pub fn validate(&self) -> Result<()> {
        self.strategy_overrides()?;
        if self.recovery.max_restart_attempts == 0 {
            anyhow::bail!("recovery.max_restart_attempts must be at least 1");
        }
        if self.recovery.hook_timeout_secs == 0 {
            anyhow::bail!("recovery.hook_timeout_secs must be at least 1");
        }
        if self.recovery.persisted_history_limit == 0 {
            anyhow::bail!("recovery.persisted_history_limit must be at least 1");
        }
        if self.recovery.reset_after_successes == Some(0) {
            anyhow::bail!("recovery.reset_after_successes must be at least 1 when set");
        }
        for (name, t) in [
            ("cpu", &self.monitor.cpu),
            ("memory", &self.monitor.memory),
            ("disk", &self.monitor.disk),
            ("temperature", &self.monitor.temperature),
        ] {
            if t.warning > t.critical {
                anyhow::bail!(
                    "monitor.{}: warning ({}) is above critical ({})",
                    name,
                    t.warning,
                    t.critical
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = StosConfig::default();
        assert_eq!(config.recovery.max_restart_attempts, 3);
        assert_eq!(config.recovery.restart_cooldown(), Duration::from_secs(300));
        assert_eq!(config.monitor.cpu, MetricThresholds::new(75.0, 90.0));
        assert!(config.strategies.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[recovery]
max_restart_attempts = 5

[strategies]
network = "retry"
unknown = "escalate_fatal"

[monitor.cpu]
warning = 60.0
critical = 70.0
"#
        )
        .unwrap();

        let config = StosConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.recovery.max_restart_attempts, 5);
        assert_eq!(config.recovery.restart_cooldown_secs, 300);
        let overrides = config.strategy_overrides().unwrap();
        assert_eq!(overrides.get(&ErrorKind::Network), Some(&RecoveryAction::Retry));
        assert_eq!(
            overrides.get(&ErrorKind::Unknown),
            Some(&RecoveryAction::EscalateFatal)
        );
        assert_eq!(config.monitor.cpu.critical, 70.0);
        assert_eq!(config.monitor.memory, MetricThresholds::new(80.0, 90.0));
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitor.disk]\nwarning = 99.0\ncritical = 90.0").unwrap();

        let err = StosConfig::load_from(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("warning"));
    }

    #[test]
    fn test_unknown_strategy_kind_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[strategies]\nbluetooth = \"retry\"").unwrap();

        let err = StosConfig::load_from(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("bluetooth"));
    }

    #[test]
    fn test_zero_reset_after_successes_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[recovery]\nreset_after_successes = 0").unwrap();

        let err = StosConfig::load_from(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("reset_after_successes"));

        let mut config = StosConfig::default();
        config.recovery.reset_after_successes = Some(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(StosConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = StosConfig::default();
        config.recovery.reset_after_successes = Some(10);
        config
            .strategies
            .insert("timeout".to_string(), RecoveryAction::RestartModule);

        let toml = toml::to_string(&config).unwrap();
        let parsed: StosConfig = toml::from_str(&toml).unwrap();

        assert_eq!(parsed.recovery.reset_after_successes, Some(10));
        assert_eq!(
            parsed.strategy_overrides().unwrap().get(&ErrorKind::Timeout),
            Some(&RecoveryAction::RestartModule)
        );
        assert_eq!(parsed.diagnostics.services.len(), 2);
    }
}

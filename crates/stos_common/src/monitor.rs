//! System Health Monitor
//!
//! Periodic sampler of CPU, memory, disk and temperature. Each metric has a
//! warning and a critical threshold. Alerts are edge-triggered: one alert per
//! upward crossing, re-armed once the metric falls back below the level.

use crate::classifier::Severity;
use crate::config::{MetricThresholds, MonitorConfig};
use crate::history::BoundedLog;
use crate::notify::Notification;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use sysinfo::{Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::sync::{mpsc::UnboundedSender, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cpu,
    Memory,
    Disk,
    Temperature,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Cpu, Metric::Memory, Metric::Disk, Metric::Temperature];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Temperature => "temperature",
        }
    }

    fn describe(&self, value: f64) -> String {
        match self {
            Self::Cpu => format!("CPU usage at {:.1}%", value),
            Self::Memory => format!("Memory usage at {:.1}%", value),
            Self::Disk => format!("Disk usage at {:.1}%", value),
            Self::Temperature => format!("CPU temperature at {:.1}°C", value),
        }
    }

    fn title(&self, level: AlertLevel) -> &'static str {
        match (self, level) {
            (Self::Cpu, AlertLevel::Critical) => "High CPU Usage",
            (Self::Cpu, _) => "Elevated CPU Usage",
            (Self::Memory, AlertLevel::Critical) => "Critical Memory Usage",
            (Self::Memory, _) => "High Memory Usage",
            (Self::Disk, AlertLevel::Critical) => "Disk Space Critical",
            (Self::Disk, _) => "Low Disk Space",
            (Self::Temperature, AlertLevel::Critical) => "Critical Temperature",
            (Self::Temperature, _) => "High Temperature",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a metric sits relative to its thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Normal,
    Warning,
    Critical,
}

impl AlertLevel {
    /// Thresholds are exclusive: a value equal to the warning level is normal
    pub fn for_value(value: f64, thresholds: &MetricThresholds) -> Self {
        if value > thresholds.critical {
            Self::Critical
        } else if value > thresholds.warning {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

/// One reading of all metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    /// Absent on hardware without a thermal sensor
    pub temperature_c: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ResourceSample {
    pub fn new(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            disk_percent,
            temperature_c: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_temperature(mut self, celsius: f64) -> Self {
        self.temperature_c = Some(celsius);
        self
    }

    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Cpu => Some(self.cpu_percent),
            Metric::Memory => Some(self.memory_percent),
            Metric::Disk => Some(self.disk_percent),
            Metric::Temperature => self.temperature_c,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub id: Uuid,
    pub metric: Metric,
    pub level: AlertLevel,
    pub value: f64,
    /// The threshold that was crossed
    pub threshold: f64,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthAlert {
    pub fn to_notification(&self) -> Notification {
        let severity = match self.level {
            AlertLevel::Critical => Severity::Critical,
            AlertLevel::Warning => Severity::Medium,
            AlertLevel::Normal => Severity::Low,
        };
        let notification = Notification::new(severity, self.title.clone(), self.message.clone());
        match self.metric {
            Metric::Memory => notification.with_action("Close modules you are not using"),
            Metric::Disk => notification.with_action("Free up storage space"),
            Metric::Temperature => notification.with_action("Check ventilation around the device"),
            Metric::Cpu => notification,
        }
    }
}

/// Source of resource samples
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> Result<ResourceSample>;
}

/// Samples the local machine with sysinfo
pub struct SysinfoSampler {
    system: System,
    disk_path: PathBuf,
    /// When the CPU counters were last refreshed
    cpu_refreshed_at: Instant,
}

impl SysinfoSampler {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        // CPU usage is a delta; prime it so the first sample is meaningful
        system.refresh_cpu();
        Self {
            system,
            disk_path: disk_path.into(),
            cpu_refreshed_at: Instant::now(),
        }
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<ResourceSample> {
        // Refreshing sooner than this reads the CPU as idle
        let since = self.cpu_refreshed_at.elapsed();
        if since < MINIMUM_CPU_UPDATE_INTERVAL {
            std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL - since);
        }
        self.system.refresh_cpu();
        self.cpu_refreshed_at = Instant::now();
        self.system.refresh_memory();

        let cpu_percent = self.system.global_cpu_info().cpu_usage() as f64;

        let total = self.system.total_memory();
        let memory_percent = if total > 0 {
            (self.system.used_memory() as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        let disk_percent = disk_usage_percent(&self.disk_path).unwrap_or_else(|| {
            debug!("No disk found for {}", self.disk_path.display());
            0.0
        });

        let mut sample = ResourceSample::new(cpu_percent, memory_percent, disk_percent);
        sample.temperature_c = read_temperature();
        Ok(sample)
    }
}

/// Usage of the filesystem holding `path`: the disk with the longest
/// mount point that prefixes it
pub(crate) fn disk_usage_percent(path: &Path) -> Option<f64> {
    let (total, available) = disk_space(path)?;
    if total == 0 {
        return None;
    }
    Some(((total - available.min(total)) as f64 / total as f64) * 100.0)
}

/// (total, available) bytes for the filesystem holding `path`
pub(crate) fn disk_space(path: &Path) -> Option<(u64, u64)> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| (d.total_space(), d.available_space()))
}

fn read_temperature() -> Option<f64> {
    let raw = fs::read_to_string(THERMAL_ZONE).ok()?;
    let millidegrees: f64 = raw.trim().parse().ok()?;
    Some(millidegrees / 1000.0)
}

/// Threshold state and bounded histories
pub struct SystemHealthMonitor {
    config: MonitorConfig,
    levels: Mutex<HashMap<Metric, AlertLevel>>,
    samples: BoundedLog<ResourceSample>,
    alerts: BoundedLog<HealthAlert>,
}

impl SystemHealthMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            levels: Mutex::new(HashMap::new()),
            samples: BoundedLog::new(config.sample_history_limit),
            alerts: BoundedLog::new(config.alert_history_limit),
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn thresholds(&self, metric: Metric) -> &MetricThresholds {
        match metric {
            Metric::Cpu => &self.config.cpu,
            Metric::Memory => &self.config.memory,
            Metric::Disk => &self.config.disk,
            Metric::Temperature => &self.config.temperature,
        }
    }

    /// Record a sample and return the alerts it raises
    pub fn observe(&self, sample: ResourceSample) -> Vec<HealthAlert> {
        let mut raised = Vec::new();
        {
            let mut levels = self.levels.lock().unwrap_or_else(|e| e.into_inner());
            for metric in Metric::ALL {
                let Some(value) = sample.value(metric) else {
                    continue;
                };
                let thresholds = self.thresholds(metric);
                let level = AlertLevel::for_value(value, thresholds);
                let previous = levels.insert(metric, level).unwrap_or(AlertLevel::Normal);

                if level <= previous {
                    if level < previous {
                        debug!("{} back to {:?} at {:.1}", metric, level, value);
                    }
                    continue;
                }

                let threshold = match level {
                    AlertLevel::Critical => thresholds.critical,
                    _ => thresholds.warning,
                };
                raised.push(HealthAlert {
                    id: Uuid::new_v4(),
                    metric,
                    level,
                    value,
                    threshold,
                    title: metric.title(level).to_string(),
                    message: metric.describe(value),
                    timestamp: sample.timestamp,
                });
            }
        }

        for alert in &raised {
            match alert.level {
                AlertLevel::Critical => error!("ALERT: {} - {}", alert.title, alert.message),
                _ => warn!("ALERT: {} - {}", alert.title, alert.message),
            }
            self.alerts.push(alert.clone());
        }
        self.samples.push(sample);
        raised
    }

    pub fn current_level(&self, metric: Metric) -> AlertLevel {
        self.levels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&metric)
            .copied()
            .unwrap_or(AlertLevel::Normal)
    }

    pub fn latest_sample(&self) -> Option<ResourceSample> {
        self.samples.last(1).pop()
    }

    pub fn sample_history(&self, limit: usize) -> Vec<ResourceSample> {
        self.samples.last(limit)
    }

    pub fn alert_history(&self, limit: usize) -> Vec<HealthAlert> {
        self.alerts.last(limit)
    }

    /// Sample on a fixed interval until `shutdown` turns true or its
    /// sender is dropped. Alerts go out through `alerts` without blocking.
    pub async fn run<S>(
        self: Arc<Self>,
        mut sampler: S,
        alerts: UnboundedSender<HealthAlert>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        S: ResourceSampler + 'static,
    {
        let mut ticker = interval(self.config.interval());
        info!(
            "System health monitor started (every {}s)",
            self.config.interval().as_secs()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sampler.sample() {
                        Ok(sample) => {
                            for alert in self.observe(sample) {
                                if alerts.send(alert).is_err() {
                                    debug!("Alert receiver dropped");
                                }
                            }
                        }
                        Err(e) => warn!("Resource sampling failed: {:#}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("System health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedSampler(VecDeque<ResourceSample>);

    impl ResourceSampler for ScriptedSampler {
        fn sample(&mut self) -> Result<ResourceSample> {
            self.0
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    #[test]
    fn test_level_thresholds_are_exclusive() {
        let t = MetricThresholds::new(75.0, 90.0);
        assert_eq!(AlertLevel::for_value(75.0, &t), AlertLevel::Normal);
        assert_eq!(AlertLevel::for_value(75.1, &t), AlertLevel::Warning);
        assert_eq!(AlertLevel::for_value(90.0, &t), AlertLevel::Warning);
        assert_eq!(AlertLevel::for_value(99.0, &t), AlertLevel::Critical);
    }

    #[test]
    fn test_warning_then_critical_raises_two() {
        let monitor = SystemHealthMonitor::new(MonitorConfig::default());
        let first = monitor.observe(ResourceSample::new(80.0, 10.0, 10.0));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].level, AlertLevel::Warning);
        assert_eq!(first[0].title, "Elevated CPU Usage");

        let second = monitor.observe(ResourceSample::new(95.0, 10.0, 10.0));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].level, AlertLevel::Critical);
        assert_eq!(second[0].threshold, 90.0);

        // critical -> warning is a fall, not an alert
        assert!(monitor.observe(ResourceSample::new(80.0, 10.0, 10.0)).is_empty());
        assert_eq!(monitor.current_level(Metric::Cpu), AlertLevel::Warning);
    }

    #[test]
    fn test_missing_temperature_is_skipped() {
        let monitor = SystemHealthMonitor::new(MonitorConfig::default());
        assert!(monitor.observe(ResourceSample::new(1.0, 1.0, 1.0)).is_empty());
        assert_eq!(monitor.current_level(Metric::Temperature), AlertLevel::Normal);

        let alerts = monitor.observe(ResourceSample::new(1.0, 1.0, 1.0).with_temperature(85.0));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, Metric::Temperature);
        assert_eq!(alerts[0].message, "CPU temperature at 85.0°C");
    }

    #[test]
    fn test_histories_are_bounded() {
        let config = MonitorConfig {
            sample_history_limit: 3,
            alert_history_limit: 2,
            ..Default::default()
        };
        let monitor = SystemHealthMonitor::new(config);
        for i in 0..6 {
            // alternate so every other sample re-crosses
            let cpu = if i % 2 == 0 { 95.0 } else { 10.0 };
            monitor.observe(ResourceSample::new(cpu, 10.0, 10.0));
        }
        assert_eq!(monitor.sample_history(10).len(), 3);
        assert_eq!(monitor.alert_history(10).len(), 2);
        assert_eq!(monitor.latest_sample().map(|s| s.cpu_percent), Some(10.0));
    }

    #[test]
    fn test_alert_notification() {
        let monitor = SystemHealthMonitor::new(MonitorConfig::default());
        let alerts = monitor.observe(ResourceSample::new(10.0, 10.0, 97.0));
        let n = alerts[0].to_notification();
        assert_eq!(n.severity, Severity::Critical);
        assert_eq!(n.title, "Disk Space Critical");
        assert_eq!(n.suggested_action.as_deref(), Some("Free up storage space"));
    }

    #[test]
    fn test_first_sample_waits_for_cpu_interval() {
        let started = Instant::now();
        let mut sampler = SysinfoSampler::new("/");
        let sample = sampler.sample().unwrap();

        assert!(started.elapsed() >= MINIMUM_CPU_UPDATE_INTERVAL);
        assert!((0.0..=100.0).contains(&sample.cpu_percent));
        assert!((0.0..=100.0).contains(&sample.memory_percent));
    }

    #[tokio::test]
    async fn test_run_sends_alerts_and_stops() {
        let monitor = Arc::new(SystemHealthMonitor::new(MonitorConfig::default()));
        let sampler = ScriptedSampler(VecDeque::from(vec![ResourceSample::new(10.0, 95.0, 10.0)]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&monitor).run(sampler, tx, stop_rx));

        // The first tick fires immediately
        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.metric, Metric::Memory);
        assert_eq!(alert.level, AlertLevel::Critical);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(monitor.alert_history(10).len(), 1);
    }
}

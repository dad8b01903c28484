//! Diagnostic Tools
//!
//! On-demand read-only checks bundled into one report. A check that errors
//! or panics shows up as an `error` entry; the other checks still run.

use crate::classifier::Fault;
use crate::config::{DiagnosticsConfig, ServiceEndpoint};
use crate::monitor::disk_space;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::statvfs::{statvfs, FsFlags};
use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::{debug, info, warn};

const MB: u64 = 1024 * 1024;

/// Result of one check, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    /// The check itself could not run
    Error,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a check found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckFinding {
    pub status: CheckStatus,
    pub message: String,
    /// Extra data for the report (JSON)
    pub details: Option<serde_json::Value>,
}

impl CheckFinding {
    pub fn pass(message: impl Into<String>) -> Self {
        Self::with_status(CheckStatus::Pass, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::with_status(CheckStatus::Warn, message)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::with_status(CheckStatus::Fail, message)
    }

    fn with_status(status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A read-only check
pub trait DiagnosticCheck: Send + Sync {
    fn name(&self) -> String;

    /// `Err` means the check could not determine anything
    fn run(&self) -> Result<CheckFinding>;
}

/// One report entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    /// Worst status among the entries
    pub overall: CheckStatus,
    pub entries: Vec<CheckOutcome>,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticReport {
    pub fn entry(&self, name: &str) -> Option<&CheckOutcome> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize diagnostic report")
    }
}

/// Registry of checks
#[derive(Default)]
pub struct DiagnosticTools {
    checks: Vec<Box<dyn DiagnosticCheck>>,
}

impl DiagnosticTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connectivity, disk, memory and one check per configured service
    pub fn with_defaults(config: &DiagnosticsConfig) -> Self {
        let mut tools = Self::new();
        tools.add(ConnectivityCheck::new(
            config.connectivity_targets.clone(),
            config.connect_timeout(),
        ));
        tools.add(DiskCheck::new(config.disk_path.clone(), config.min_free_disk_mb));
        tools.add(MemoryCheck::new(config.min_available_memory_mb));
        for endpoint in &config.services {
            tools.add(ServiceCheck::new(endpoint.clone(), config.connect_timeout()));
        }
        tools
    }

    pub fn add(&mut self, check: impl DiagnosticCheck + 'static) {
        self.checks.push(Box::new(check));
    }

    pub fn check_names(&self) -> Vec<String> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run every check, in registration order
    pub fn run_all(&self) -> DiagnosticReport {
        let entries: Vec<CheckOutcome> = self.checks.iter().map(|c| run_check(c.as_ref())).collect();
        let overall = entries
            .iter()
            .map(|e| e.status)
            .max()
            .unwrap_or(CheckStatus::Pass);

        info!(
            "Diagnostics finished: {} ({} checks)",
            overall,
            entries.len()
        );
        DiagnosticReport {
            overall,
            entries,
            timestamp: Utc::now(),
        }
    }

    /// Run the check with the given name only
    pub fn run_one(&self, name: &str) -> Option<CheckOutcome> {
        self.checks
            .iter()
            .find(|c| c.name() == name)
            .map(|c| run_check(c.as_ref()))
    }
}

fn run_check(check: &dyn DiagnosticCheck) -> CheckOutcome {
    let name = check.name();
    let started = Instant::now();

    let finding = match panic::catch_unwind(AssertUnwindSafe(|| check.run())) {
        Ok(Ok(finding)) => finding,
        Ok(Err(e)) => CheckFinding::with_status(CheckStatus::Error, format!("{:#}", e)),
        Err(payload) => CheckFinding::with_status(
            CheckStatus::Error,
            format!("check panicked: {}", Fault::from_panic(payload.as_ref())),
        ),
    };

    match finding.status {
        CheckStatus::Pass => debug!("Check {}: {}", name, finding.message),
        _ => warn!("Check {} {}: {}", name, finding.status, finding.message),
    }

    CheckOutcome {
        name,
        status: finding.status,
        message: finding.message,
        details: finding.details,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// Try each resolved address of `target` until one accepts
fn tcp_reachable(target: &str, timeout: Duration) -> Result<()> {
    let addrs: Vec<_> = target
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}", target))?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(anyhow::Error::from(e).context(format!("Failed to connect to {}", target))),
        None => anyhow::bail!("{} resolved to no addresses", target),
    }
}

/// Passes if any target accepts a TCP connection
pub struct ConnectivityCheck {
    targets: Vec<String>,
    timeout: Duration,
}

impl ConnectivityCheck {
    pub fn new(targets: Vec<String>, timeout: Duration) -> Self {
        Self { targets, timeout }
    }
}

impl DiagnosticCheck for ConnectivityCheck {
    fn name(&self) -> String {
        "connectivity".to_string()
    }

    fn run(&self) -> Result<CheckFinding> {
        if self.targets.is_empty() {
            return Ok(CheckFinding::warn("No connectivity targets configured"));
        }

        let mut failures = Vec::new();
        for target in &self.targets {
            match tcp_reachable(target, self.timeout) {
                Ok(()) => return Ok(CheckFinding::pass(format!("{} reachable", target))),
                Err(e) => failures.push(format!("{:#}", e)),
            }
        }
        Ok(CheckFinding::fail("No connectivity target reachable")
            .with_details(serde_json::json!({ "errors": failures })))
    }
}

/// Free space and writability of a path
pub struct DiskCheck {
    path: PathBuf,
    min_free_mb: u64,
}

impl DiskCheck {
    pub fn new(path: impl Into<PathBuf>, min_free_mb: u64) -> Self {
        Self {
            path: path.into(),
            min_free_mb,
        }
    }
}

impl DiagnosticCheck for DiskCheck {
    fn name(&self) -> String {
        "disk".to_string()
    }

    fn run(&self) -> Result<CheckFinding> {
        if !self.path.exists() {
            return Ok(CheckFinding::fail(format!(
                "{} does not exist",
                self.path.display()
            )));
        }

        if let Some(reason) = unwritable_reason(&self.path)? {
            return Ok(CheckFinding::fail(reason));
        }

        let Some((total, available)) = disk_space(&self.path) else {
            return Ok(CheckFinding::warn(format!(
                "Could not determine free space for {}",
                self.path.display()
            )));
        };

        let free_mb = available / MB;
        let details = serde_json::json!({
            "path": self.path.display().to_string(),
            "total_mb": total / MB,
            "free_mb": free_mb,
        });
        if free_mb < self.min_free_mb {
            Ok(CheckFinding::fail(format!(
                "Only {} MB free on {} (minimum {} MB)",
                free_mb,
                self.path.display(),
                self.min_free_mb
            ))
            .with_details(details))
        } else {
            Ok(CheckFinding::pass(format!("{} MB free", free_mb)).with_details(details))
        }
    }
}

/// Why `path` cannot be written by this process, found without writing to it
fn unwritable_reason(path: &Path) -> Result<Option<String>> {
    let stat = statvfs(path).with_context(|| format!("statvfs failed on {}", path.display()))?;
    if stat.flags().contains(FsFlags::ST_RDONLY) {
        return Ok(Some(format!("{} is on a read-only filesystem", path.display())));
    }

    match access(path, AccessFlags::W_OK) {
        Ok(()) => Ok(None),
        Err(Errno::EROFS) => Ok(Some(format!("{} is on a read-only filesystem", path.display()))),
        Err(errno @ (Errno::EACCES | Errno::EPERM)) => Ok(Some(format!(
            "{} is not writable by this user: {}",
            path.display(),
            errno
        ))),
        Err(errno) => {
            Err(errno).with_context(|| format!("Write access check failed on {}", path.display()))
        }
    }
}

/// Available memory headroom
pub struct MemoryCheck {
    min_available_mb: u64,
}

impl MemoryCheck {
    pub fn new(min_available_mb: u64) -> Self {
        Self { min_available_mb }
    }
}

impl DiagnosticCheck for MemoryCheck {
    fn name(&self) -> String {
        "memory".to_string()
    }

    fn run(&self) -> Result<CheckFinding> {
        let mut sys = System::new();
        sys.refresh_memory();

        let total_mb = sys.total_memory() / MB;
        if total_mb == 0 {
            return Ok(CheckFinding::warn("Memory information unavailable"));
        }
        let available_mb = sys.available_memory() / MB;
        let details = serde_json::json!({
            "total_mb": total_mb,
            "available_mb": available_mb,
        });

        if available_mb < self.min_available_mb {
            Ok(CheckFinding::fail(format!(
                "Only {} MB available (minimum {} MB)",
                available_mb, self.min_available_mb
            ))
            .with_details(details))
        } else {
            Ok(CheckFinding::pass(format!("{} MB of {} MB available", available_mb, total_mb))
                .with_details(details))
        }
    }
}

/// TCP reachability of an external service
pub struct ServiceCheck {
    endpoint: ServiceEndpoint,
    timeout: Duration,
}

impl ServiceCheck {
    pub fn new(endpoint: ServiceEndpoint, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }
}

impl DiagnosticCheck for ServiceCheck {
    fn name(&self) -> String {
        format!("service:{}", self.endpoint.name)
    }

    fn run(&self) -> Result<CheckFinding> {
        match tcp_reachable(&self.endpoint.address, self.timeout) {
            Ok(()) => Ok(CheckFinding::pass(format!("{} reachable", self.endpoint.address))),
            Err(e) => Ok(CheckFinding::fail(format!("{:#}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    struct Fixed(&'static str, CheckStatus);

    impl DiagnosticCheck for Fixed {
        fn name(&self) -> String {
            self.0.to_string()
        }

        fn run(&self) -> Result<CheckFinding> {
            Ok(CheckFinding::with_status(self.1, "fixed"))
        }
    }

    struct Panicking;

    impl DiagnosticCheck for Panicking {
        fn name(&self) -> String {
            "panicking".to_string()
        }

        fn run(&self) -> Result<CheckFinding> {
            panic!("sensor bus gone")
        }
    }

    #[test]
    fn test_overall_is_worst_status() {
        let mut tools = DiagnosticTools::new();
        tools.add(Fixed("a", CheckStatus::Pass));
        tools.add(Fixed("b", CheckStatus::Warn));
        assert_eq!(tools.run_all().overall, CheckStatus::Warn);

        tools.add(Fixed("c", CheckStatus::Fail));
        assert_eq!(tools.run_all().overall, CheckStatus::Fail);
    }

    #[test]
    fn test_panicking_check_is_reported() {
        let mut tools = DiagnosticTools::new();
        tools.add(Panicking);
        tools.add(Fixed("after", CheckStatus::Pass));

        let report = tools.run_all();
        assert_eq!(report.entries.len(), 2);
        let entry = report.entry("panicking").unwrap();
        assert_eq!(entry.status, CheckStatus::Error);
        assert!(entry.message.contains("sensor bus gone"));
        assert_eq!(report.entry("after").unwrap().status, CheckStatus::Pass);
    }

    #[test]
    fn test_connectivity_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let check = ConnectivityCheck::new(vec![addr], Duration::from_millis(500));
        assert_eq!(check.run().unwrap().status, CheckStatus::Pass);

        let empty = ConnectivityCheck::new(Vec::new(), Duration::from_millis(500));
        assert_eq!(empty.run().unwrap().status, CheckStatus::Warn);
    }

    #[test]
    fn test_service_check_unreachable() {
        // Bind then drop to get a port nothing listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let check = ServiceCheck::new(
            ServiceEndpoint {
                name: "spotify".to_string(),
                address: format!("127.0.0.1:{}", port),
            },
            Duration::from_millis(500),
        );
        assert_eq!(check.name(), "service:spotify");
        assert_eq!(check.run().unwrap().status, CheckStatus::Fail);
    }

    #[test]
    fn test_disk_check_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let check = DiskCheck::new(dir.path().join("missing"), 0);
        assert_eq!(check.run().unwrap().status, CheckStatus::Fail);

        let present = DiskCheck::new(dir.path(), 0);
        assert_ne!(present.run().unwrap().status, CheckStatus::Fail);
    }

    #[test]
    fn test_disk_check_fails_on_unwritable_dir() {
        // Root bypasses mode bits
        if nix::unistd::Uid::effective().is_root() {
            return;
        }
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        let finding = DiskCheck::new(locked.clone(), 0).run().unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(finding.status, CheckStatus::Fail);
        assert!(finding.message.contains("not writable"), "{}", finding.message);
    }

    #[test]
    fn test_disk_check_fails_on_read_only_mount() {
        let mounts = std::fs::read_to_string("/proc/self/mounts").unwrap_or_default();
        let read_only = mounts.lines().find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let ro = fields.get(3)?.split(',').any(|opt| opt == "ro");
            let path = PathBuf::from(*fields.get(1)?);
            (ro && path.is_dir() && statvfs(&path).is_ok()).then_some(path)
        });
        // Nothing mounted read-only on this host
        let Some(path) = read_only else {
            return;
        };

        let finding = DiskCheck::new(path.clone(), 0).run().unwrap();
        assert_eq!(finding.status, CheckStatus::Fail, "{}", path.display());
        assert!(finding.message.contains("read-only"), "{}", finding.message);
    }

    #[test]
    fn test_default_check_names() {
        let tools = DiagnosticTools::with_defaults(&DiagnosticsConfig::default());
        assert_eq!(
            tools.check_names(),
            vec![
                "connectivity",
                "disk",
                "memory",
                "service:google_calendar",
                "service:spotify"
            ]
        );
    }

    #[test]
    fn test_report_json() {
        let mut tools = DiagnosticTools::new();
        tools.add(Fixed("memory", CheckStatus::Pass));
        let json = tools.run_all().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["overall"], "pass");
        assert_eq!(value["entries"][0]["name"], "memory");
    }
}

//! Error Classifier
//!
//! Maps a fault raised inside a feature module to an error kind and a
//! severity. `classify` is pure: the same fault and context always give the
//! same answer. Escalation of repeated faults lives in `PatternDetector`,
//! which owns the sliding-window state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::str::FromStr;

/// Occurrences within the window that escalate severity by one level
pub const PATTERN_WARN_COUNT: u32 = 5;
/// Occurrences within the window that escalate severity by two levels
pub const PATTERN_FREQUENT_COUNT: u32 = 10;
/// Occurrences within the window that force Critical
pub const PATTERN_CRITICAL_COUNT: u32 = 20;

/// Error kind taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Hardware,
    Module,
    System,
    ExternalApi,
    Config,
    Memory,
    Permission,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::Network,
        ErrorKind::Hardware,
        ErrorKind::Module,
        ErrorKind::System,
        ErrorKind::ExternalApi,
        ErrorKind::Config,
        ErrorKind::Memory,
        ErrorKind::Permission,
        ErrorKind::Timeout,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Hardware => "hardware",
            Self::Module => "module",
            Self::System => "system",
            Self::ExternalApi => "external_api",
            Self::Config => "config",
            Self::Memory => "memory",
            Self::Permission => "permission",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    /// Severity before any heuristics are applied
    pub fn base_severity(&self) -> Severity {
        match self {
            Self::Timeout => Severity::Low,
            Self::Network | Self::Module | Self::ExternalApi | Self::Config | Self::Unknown => {
                Severity::Medium
            }
            Self::Hardware | Self::System | Self::Permission => Severity::High,
            Self::Memory => Severity::Critical,
        }
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown error kind: {}", s))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Raise severity by `levels`, saturating at Critical
    pub fn escalate(self, levels: u8) -> Severity {
        let rank = (self as u8).saturating_add(levels).min(Severity::Critical as u8);
        match rank {
            0 => Severity::Low,
            1 => Severity::Medium,
            2 => Severity::High,
            _ => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a module knows about the fault it hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultCategory {
    /// Operating-system I/O error
    Io(io::ErrorKind),
    /// Connection could not be established or was dropped
    Connection,
    /// Third-party API answered with an HTTP error status
    Http { status: u16 },
    Timeout,
    OutOfMemory,
    PermissionDenied,
    Config,
    Hardware,
    /// Module-internal failure (bad state, failed initialization)
    Module,
    /// The module panicked
    Panic,
    /// Nothing structured is known; classification falls back to text
    Other,
}

/// A fault caught at a module boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub category: FaultCategory,
    pub message: String,
}

impl Fault {
    pub fn new(category: FaultCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    /// Fault with no structured category
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FaultCategory::Other, message)
    }

    /// Build a fault from a caught panic payload
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new(FaultCategory::Panic, message)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<io::Error> for Fault {
    fn from(err: io::Error) -> Self {
        Self::new(FaultCategory::Io(err.kind()), err.to_string())
    }
}

impl From<anyhow::Error> for Fault {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<io::Error>() {
            Some(io_err) => Self::new(FaultCategory::Io(io_err.kind()), format!("{:#}", err)),
            None => Self::other(format!("{:#}", err)),
        }
    }
}

/// Keyword table for unstructured faults. Multi-word entries match as
/// phrases, single words match whole tokens. First match wins.
const KEYWORDS: &[(&str, ErrorKind)] = &[
    ("timed out", ErrorKind::Timeout),
    ("timeout", ErrorKind::Timeout),
    ("deadline", ErrorKind::Timeout),
    ("out of memory", ErrorKind::Memory),
    ("oom", ErrorKind::Memory),
    ("allocation", ErrorKind::Memory),
    ("permission", ErrorKind::Permission),
    ("access denied", ErrorKind::Permission),
    ("forbidden", ErrorKind::Permission),
    ("unauthorized", ErrorKind::ExternalApi),
    ("rate limit", ErrorKind::ExternalApi),
    ("quota", ErrorKind::ExternalApi),
    ("api", ErrorKind::ExternalApi),
    ("http", ErrorKind::ExternalApi),
    ("oauth", ErrorKind::ExternalApi),
    ("connection", ErrorKind::Network),
    ("network", ErrorKind::Network),
    ("dns", ErrorKind::Network),
    ("unreachable", ErrorKind::Network),
    ("socket", ErrorKind::Network),
    ("offline", ErrorKind::Network),
    ("config", ErrorKind::Config),
    ("configuration", ErrorKind::Config),
    ("setting", ErrorKind::Config),
    ("missing key", ErrorKind::Config),
    ("gpio", ErrorKind::Hardware),
    ("i2c", ErrorKind::Hardware),
    ("sensor", ErrorKind::Hardware),
    ("microphone", ErrorKind::Hardware),
    ("display", ErrorKind::Hardware),
    ("touchscreen", ErrorKind::Hardware),
    ("disk", ErrorKind::System),
    ("filesystem", ErrorKind::System),
    ("database", ErrorKind::System),
    ("module", ErrorKind::Module),
];

/// Classify a fault into (kind, severity)
///
/// Never fails: anything unrecognized is `(Unknown, Medium)`.
pub fn classify(fault: &Fault, context: &str) -> (ErrorKind, Severity) {
    let kind = match &fault.category {
        FaultCategory::Io(io_kind) => kind_for_io(*io_kind),
        FaultCategory::Connection => ErrorKind::Network,
        FaultCategory::Http { .. } => ErrorKind::ExternalApi,
        FaultCategory::Timeout => ErrorKind::Timeout,
        FaultCategory::OutOfMemory => ErrorKind::Memory,
        FaultCategory::PermissionDenied => ErrorKind::Permission,
        FaultCategory::Config => ErrorKind::Config,
        FaultCategory::Hardware => ErrorKind::Hardware,
        FaultCategory::Module | FaultCategory::Panic => ErrorKind::Module,
        FaultCategory::Other => kind_from_text(&fault.message, context),
    };

    let severity = match &fault.category {
        FaultCategory::Http { status: 401 | 403 } => Severity::High,
        FaultCategory::Http { status } if *status >= 500 => Severity::Medium,
        FaultCategory::Http { .. } => Severity::Low,
        FaultCategory::Panic => Severity::High,
        _ => kind.base_severity(),
    };

    (kind, severity)
}

fn kind_for_io(kind: io::ErrorKind) -> ErrorKind {
    use io::ErrorKind as Io;
    match kind {
        Io::ConnectionRefused
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::AddrInUse
        | Io::AddrNotAvailable
        | Io::BrokenPipe => ErrorKind::Network,
        Io::TimedOut | Io::WouldBlock => ErrorKind::Timeout,
        Io::PermissionDenied => ErrorKind::Permission,
        Io::OutOfMemory => ErrorKind::Memory,
        Io::InvalidInput | Io::InvalidData => ErrorKind::Config,
        _ => ErrorKind::System,
    }
}

fn kind_from_text(message: &str, context: &str) -> ErrorKind {
    let haystack = format!("{} {}", message, context).to_lowercase();
    let tokens: Vec<&str> = haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    KEYWORDS
        .iter()
        .find(|(keyword, _)| {
            if keyword.contains(' ') {
                haystack.contains(keyword)
            } else {
                tokens.iter().any(|t| t == keyword)
            }
        })
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

/// Counts repeated faults per (module, kind) inside a sliding window
#[derive(Debug)]
pub struct PatternDetector {
    window: Duration,
    occurrences: HashMap<(String, ErrorKind), VecDeque<DateTime<Utc>>>,
}

impl PatternDetector {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::seconds(300)),
            occurrences: HashMap::new(),
        }
    }

    /// Record one occurrence and return how many fall inside the window
    pub fn observe(&mut self, module_id: &str, kind: ErrorKind, at: DateTime<Utc>) -> u32 {
        let entries = self
            .occurrences
            .entry((module_id.to_string(), kind))
            .or_default();
        entries.push_back(at);

        let cutoff = at - self.window;
        while entries.front().map(|t| *t < cutoff).unwrap_or(false) {
            entries.pop_front();
        }

        entries.len() as u32
    }

    /// Apply the 5/10/20 escalation ladder
    pub fn escalate(severity: Severity, occurrences: u32) -> Severity {
        if occurrences >= PATTERN_CRITICAL_COUNT {
            Severity::Critical
        } else if occurrences >= PATTERN_FREQUENT_COUNT {
            severity.escalate(2)
        } else if occurrences >= PATTERN_WARN_COUNT {
            severity.escalate(1)
        } else {
            severity
        }
    }

    pub fn clear(&mut self) {
        self.occurrences.clear();
    }
}

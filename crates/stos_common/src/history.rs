//! Append-only history stores
//!
//! Error records and recovery outcomes are appended from many module
//! contexts at once. Readers always see whole records in append order.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Storage collaborator for records
pub trait HistoryStore<T>: Send + Sync {
    /// Append one record
    fn append(&self, record: &T) -> Result<()>;

    /// Most recent `n` records, oldest first
    fn recent(&self, n: usize) -> Result<Vec<T>>;
}

/// In-memory ring that evicts the oldest entries past its capacity
#[derive(Debug)]
pub struct BoundedLog<T> {
    entries: RwLock<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, record: T) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.push_back(record);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Last `n` entries, oldest first
    pub fn last(&self, n: usize) -> Vec<T> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Last `n` entries matching `pred`, oldest first
    pub fn last_matching<F>(&self, n: usize, pred: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<T> = entries.iter().rev().filter(|e| pred(e)).take(n).cloned().collect();
        matched.reverse();
        matched
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl<T: Clone + Send + Sync> HistoryStore<T> for BoundedLog<T> {
    fn append(&self, record: &T) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }

    fn recent(&self, n: usize) -> Result<Vec<T>> {
        Ok(self.last(n))
    }
}

/// Append-only JSON-lines file, one record per line.
///
/// With a limit the file is cut back to the newest `limit` lines on open,
/// and again whenever appends push it half a limit past that.
#[derive(Debug)]
pub struct JsonLinesStore<T> {
    path: PathBuf,
    limit: Option<usize>,
    /// Lines on disk, tracked only when limited
    lines: Mutex<usize>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonLinesStore<T> {
    /// Open a store, creating parent directories as needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        Ok(Self {
            path,
            limit: None,
            lines: Mutex::new(0),
            _marker: PhantomData,
        })
    }

    /// Open a store that keeps roughly the newest `limit` records
    pub fn open_with_limit(path: impl AsRef<Path>, limit: usize) -> Result<Self> {
        let mut store = Self::open(path)?;
        let limit = limit.max(1);
        let kept = compact(&store.path, limit)?;
        store.limit = Some(limit);
        store.lines = Mutex::new(kept);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

/// Rewrite `path` with only its last `limit` lines. Returns the lines kept.
fn compact(path: &Path, limit: usize) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() <= limit {
        return Ok(lines.len());
    }

    let kept = &lines[lines.len() - limit..];
    let mut body = kept.join("\n");
    body.push('\n');

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
    // Readers see either the old file or the trimmed one
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    debug!(
        "Trimmed {} to {} records ({} dropped)",
        path.display(),
        limit,
        lines.len() - limit
    );
    Ok(kept.len())
}

impl<T> HistoryStore<T> for JsonLinesStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn append(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to serialize record")?;
        line.push('\n');

        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        // One write per record keeps lines whole
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        if let Some(limit) = self.limit {
            *lines += 1;
            if *lines > limit + limit / 2 {
                *lines = compact(&self.path, limit)?;
            }
        }
        Ok(())
    }

    fn recent(&self, n: usize) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let skip = lines.len().saturating_sub(n);

        let mut records = Vec::with_capacity(lines.len() - skip);
        for line in &lines[skip..] {
            match serde_json::from_str::<T>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping malformed record in {}: {}", self.path.display(), e),
            }
        }
        Ok(records)
    }
}

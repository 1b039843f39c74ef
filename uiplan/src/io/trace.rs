//! Append-only execution trace (`trace.jsonl`).
//!
//! One JSON object per line, flushed as it is written, so a crashed run
//! still leaves every event recorded up to the crash.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::EventKind;

/// An event as produced during an attempt, before it is stamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub name: String,
    pub details: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn action(name: impl Into<String>) -> Self {
        Self::new(EventKind::Action, name)
    }

    pub fn assert(name: impl Into<String>) -> Self {
        Self::new(EventKind::Assert, name)
    }

    pub fn note(name: impl Into<String>) -> Self {
        Self::new(EventKind::Note, name)
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

/// A persisted trace line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub op_id: String,
    pub attempt_index: u32,
    pub kind: EventKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
    /// Milliseconds since the run started.
    pub t_ms: u64,
}

pub struct TraceWriter {
    path: PathBuf,
    file: File,
    started: Instant,
}

impl TraceWriter {
    pub fn create(path: &Path, started: Instant) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open trace {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            started,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, op_id: &str, attempt_index: u32, event: Event) -> Result<()> {
        let record = ExecutionEvent {
            op_id: op_id.to_string(),
            attempt_index,
            kind: event.kind,
            name: event.name,
            details: event.details,
            t_ms: self.started.elapsed().as_millis() as u64,
        };
        let mut line = serde_json::to_string(&record).context("serialize trace event")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("append trace {}", self.path.display()))?;
        self.file
            .flush()
            .with_context(|| format!("flush trace {}", self.path.display()))
    }
}

/// Read every event back, in file order.
pub fn read_trace(path: &Path) -> Result<Vec<ExecutionEvent>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read trace {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse trace {} line {}", path.display(), i + 1))
        })
        .collect()
}

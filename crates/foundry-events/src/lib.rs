//! Append-only event log for build and executor lifecycle events.
//!
//! Every component that changes observable state (the Scheduler, the
//! Pool) reports through this log rather than a general-purpose tracing
//! crate, matching the rest of this workspace's ambient stack: plain
//! structured events, one JSON object per line, readable with `jq` and
//! replayable into a `ServiceEvent` for tests.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default event log file name under the service's state directory.
pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// A single lifecycle occurrence, broad enough to reconstruct a build's
/// timeline from the log alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    BuildSubmitted { package_count: usize },
    RowDispatched { package: String, executor: String },
    RowSucceeded { package: String, executor: String },
    RowFailed { package: String, executor: String, error: String },
    RowSkipped { package: String, reason: String },
    ExecutorAdded { address: String },
    ExecutorRemoved { address: String },
    ExecutorCircuitOpened { address: String },
    ExecutorCircuitClosed { address: String },
}

/// A timestamped, build-scoped [`EventKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub timestamp: DateTime<Utc>,
    pub build_id: String,
    pub kind: EventKind,
}

impl ServiceEvent {
    pub fn new(build_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            build_id: build_id.into(),
            kind,
        }
    }
}

/// An append-only JSONL sink for [`ServiceEvent`]s.
///
/// Each call to [`EventLog::append`] opens the file in append mode and
/// writes a single line; there is no in-process buffering, so a crash
/// loses at most the event currently mid-write rather than an entire
/// session's backlog.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, event: &ServiceEvent) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open events file {}", self.path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
        writeln!(writer, "{line}").context("failed to write event line")?;
        writer.flush().context("failed to flush events file")
    }

    /// Read every event recorded so far, in append order.
    pub fn read_all(&self) -> Result<Vec<ServiceEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .with_context(|| format!("failed to open events file {}", self.path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", self.path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: ServiceEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
            events.push(event);
        }
        Ok(events)
    }

    pub fn events_for_build(&self, build_id: &str) -> Result<Vec<ServiceEvent>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.build_id == build_id)
            .collect())
    }
}

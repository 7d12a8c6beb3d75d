//! Per-session JSONL event log.
//!
//! One file per session under `sessions/session-<id>/events.jsonl`. Rows are
//! append-only and carry a strictly increasing `seq`; the logical `step`
//! repeats across validation retries by design. The log always starts with a
//! header row so even a session that dies on its first model turn leaves a
//! well-formed artifact.

use crate::fingerprint::ErrorEvent;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Filesystem layout for one session.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub session_dir: PathBuf,
    pub events_path: PathBuf,
    pub metrics_path: PathBuf,
    /// Sandbox directory owned by the adapter for fixtures and outputs.
    pub work_dir: PathBuf,
}

/// Create (or reset) the session directory under the data root.
pub fn ensure_session(data_root: &Path, session_id: u64) -> std::io::Result<SessionPaths> {
    let session_dir = data_root.join("sessions").join(format!("session-{session_id:03}"));
    let work_dir = session_dir.join("work");
    std::fs::create_dir_all(&work_dir)?;

    let events_path = session_dir.join("events.jsonl");
    let metrics_path = session_dir.join("metrics.json");
    for stale in [&events_path, &metrics_path] {
        if stale.exists() {
            std::fs::remove_file(stale)?;
        }
    }

    Ok(SessionPaths {
        session_dir,
        events_path,
        metrics_path,
        work_dir,
    })
}

/// One event-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventRow {
    SessionStart {
        seq: u64,
        session_id: u64,
        task_id: String,
        domain: String,
        ts: DateTime<Utc>,
    },
    Step {
        seq: u64,
        step: u32,
        tool: String,
        tool_input: serde_json::Value,
        ok: bool,
        error: Option<String>,
        output: Option<String>,
        /// Retrieval payload when hints were injected for this step.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory: Option<serde_json::Value>,
        ts: DateTime<Utc>,
    },
    ErrorCapture {
        seq: u64,
        step: u32,
        event: ErrorEvent,
        ts: DateTime<Utc>,
    },
}

impl EventRow {
    pub fn seq(&self) -> u64 {
        match self {
            Self::SessionStart { seq, .. } | Self::Step { seq, .. } | Self::ErrorCapture { seq, .. } => {
                *seq
            }
        }
    }
}

/// Append-only writer over one session's events.jsonl.
#[derive(Debug)]
pub struct EventLog {
    file: File,
    next_seq: u64,
}

impl EventLog {
    /// Open the log and write the header row.
    pub fn create(
        paths: &SessionPaths,
        session_id: u64,
        task_id: &str,
        domain: &str,
    ) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&paths.events_path)?;
        let mut log = Self { file, next_seq: 0 };
        log.append_row(|seq| EventRow::SessionStart {
            seq,
            session_id,
            task_id: task_id.to_owned(),
            domain: domain.to_owned(),
            ts: Utc::now(),
        })?;
        Ok(log)
    }

    fn append_row(
        &mut self,
        build: impl FnOnce(u64) -> EventRow,
    ) -> std::io::Result<()> {
        let row = build(self.next_seq);
        self.next_seq += 1;
        let mut line = serde_json::to_string(&row)
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()
    }

    /// Record one tool-call step (or validation-retry attempt at the same step).
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        step: u32,
        tool: &str,
        tool_input: serde_json::Value,
        ok: bool,
        error: Option<String>,
        output: Option<String>,
        memory: Option<serde_json::Value>,
    ) -> std::io::Result<()> {
        self.append_row(|seq| EventRow::Step {
            seq,
            step,
            tool: tool.to_owned(),
            tool_input,
            ok,
            error,
            output,
            memory,
            ts: Utc::now(),
        })
    }

    /// Record one captured failure event.
    pub fn error_capture(&mut self, step: u32, event: ErrorEvent) -> std::io::Result<()> {
        self.append_row(|seq| EventRow::ErrorCapture {
            seq,
            step,
            event,
            ts: Utc::now(),
        })
    }
}

/// Append an error event to the shared cross-session capture log. Failures
/// here only warn: the capture trail is observability, not control flow.
pub fn append_global_capture(data_root: &Path, event: &ErrorEvent) {
    let learning_dir = data_root.join("learning");
    if let Err(error) = std::fs::create_dir_all(&learning_dir) {
        tracing::warn!(%error, "failed to create learning dir");
        return;
    }
    let path = learning_dir.join("memory_events.jsonl");
    let line = match serde_json::to_string(event) {
        Ok(line) => line,
        Err(error) => {
            tracing::warn!(%error, "failed to encode error event");
            return;
        }
    };
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| writeln!(file, "{line}"));
    if let Err(error) = result {
        tracing::warn!(%error, "failed to append global capture log");
    }
}

/// Fingerprints seen in any prior session, for recurrence accounting.
pub fn load_prior_fingerprints(data_root: &Path) -> std::collections::HashSet<String> {
    let path = data_root.join("learning").join("memory_events.jsonl");
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Default::default();
    };
    text.lines()
        .filter_map(|line| serde_json::from_str::<ErrorEvent>(line).ok())
        .map(|event| event.fingerprint)
        .collect()
}

/// Read every row back, skipping unreadable lines.
pub fn read_events(path: &Path) -> Vec<EventRow> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

//! Medium diagnostics
//!
//! The medium appends distinct errors to a diagnostic log, one entry per
//! distinct error with observation counts and timestamps. A single periodic
//! task owned by the lifecycle drains entries newer than its
//! [`DiagnosticCursor`] watermark and logs them, and optionally logs the
//! medium's counters.
//!
//! The file format read by [`FileDiagnosticLog`] is JSON lines:
//!
//! ```text
//! {"observation_count":3,"first_observation_ms":1700000000000,"last_observation_ms":1700000004000,"message":"..."}
//! ```

use crate::error::{Result, TransportError};
use crate::medium::MediumCounter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One distinct error observed by the medium
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub observation_count: u32,
    pub first_observation_ms: u64,
    pub last_observation_ms: u64,
    pub message: String,
}

/// Reader over the medium's diagnostic log
pub trait DiagnosticLogReader: Send {
    /// Entries whose last observation is at or after `since_ms`
    fn read_since(&mut self, since_ms: u64) -> Result<Vec<DiagnosticEntry>>;

    fn close(&mut self) -> Result<()>;
}

/// JSON-lines diagnostic log on disk
#[derive(Debug)]
pub struct FileDiagnosticLog {
    path: PathBuf,
    closed: bool,
}

impl FileDiagnosticLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DiagnosticLogReader for FileDiagnosticLog {
    fn read_since(&mut self, since_ms: u64) -> Result<Vec<DiagnosticEntry>> {
        if self.closed {
            return Err(TransportError::closed("diagnostic log reader closed"));
        }

        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            // the medium creates the log lazily on its first error
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(TransportError::io(
                    format!("failed to read diagnostic log {}", self.path.display()),
                    e,
                ))
            }
        };

        let mut entries = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DiagnosticEntry>(line) {
                Ok(entry) if entry.last_observation_ms >= since_ms => entries.push(entry),
                Ok(_) => {}
                Err(e) => {
                    debug!(path = %self.path.display(), line = line_no + 1, error = %e, "skipping malformed diagnostic entry");
                }
            }
        }
        Ok(entries)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Watermark of the periodic drain, owned by a single task
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticCursor {
    watermark_ms: u64,
}

impl DiagnosticCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watermark_ms(&self) -> u64 {
        self.watermark_ms
    }

    /// Log every entry newer than the watermark and advance it one past the
    /// newest entry consumed
    pub fn drain(&mut self, reader: &mut dyn DiagnosticLogReader) -> Result<usize> {
        let entries = reader.read_since(self.watermark_ms)?;
        let mut newest = None;

        for entry in &entries {
            warn!(
                observation_count = entry.observation_count,
                first_observation_ms = entry.first_observation_ms,
                last_observation_ms = entry.last_observation_ms,
                "medium diagnostic: {}",
                entry.message
            );
            newest = newest.max(Some(entry.last_observation_ms));
        }

        if let Some(newest) = newest {
            self.watermark_ms = newest.saturating_add(1);
        }
        Ok(entries.len())
    }
}

/// Log a snapshot of the medium's counters
pub fn log_counters(counters: &[MediumCounter]) {
    for counter in counters {
        info!(label = %counter.label, value = counter.value, "medium counter");
    }
}

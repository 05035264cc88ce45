//! Quarantine log for rows rejected by the constraint gate.
//!
//! Rejected rows are appended as JSON lines so they can be inspected or
//! replayed offline. Writing never blocks the pipeline: serialization
//! failures are logged and dropped, and the rejection counter advances
//! regardless.

use crate::record::Record;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// Append-only JSONL sink for quarantined rows.
pub struct QuarantineWriter {
    file: Mutex<File>,
    rejected: AtomicU64,
}

#[derive(Serialize)]
struct QuarantineEntry<'a> {
    /// Capture time, RFC 3339 UTC.
    timestamp: String,
    /// Stage that rejected the row.
    stage: &'a str,
    /// Names of the violated constraints.
    violations: &'a [String],
    /// The rejected row.
    record: &'a Record,
}

impl QuarantineWriter {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            rejected: AtomicU64::new(0),
        })
    }

    /// Append one rejected row with the constraints it violated.
    pub fn record(&self, stage: &str, violations: &[String], record: &Record) {
        let entry = QuarantineEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            stage,
            violations,
            record,
        };
        match serde_json::to_string(&entry) {
            Ok(json) => {
                let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = writeln!(file, "{json}") {
                    warn!(stage, error = %e, "failed to append quarantine entry");
                }
            }
            Err(e) => warn!(stage, error = %e, "failed to serialize quarantine entry"),
        }
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Total rows quarantined since this writer was opened.
    pub fn count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

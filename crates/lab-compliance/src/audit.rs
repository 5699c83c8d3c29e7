//! Append-only audit log.
//!
//! One JSON record per line: `{seq, ts, monotonic, actor, action,
//! envelope_sha}`. The log is process-wide with at-most-one writer, opened
//! lazily on the first envelope and flushed on every append so a crash loses
//! at most the in-flight record. Audit failures are reported to the caller
//! but must never mask the measurement result they accompany.

use chrono::{DateTime, Utc};
use lab_core::{ComplianceError, MonotonicClock};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    /// Seconds since the log was opened in this process.
    pub monotonic: f64,
    pub actor: String,
    pub action: String,
    pub envelope_sha: String,
}

struct Writer {
    file: File,
    next_seq: u64,
}

/// Append-only audit log bound to one file.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<Option<Writer>>,
    clock: MonotonicClock,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
            clock: MonotonicClock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, opening the log on first use. Sequence numbers
    /// continue from whatever the existing file holds, so the log stays
    /// recoverable across restarts.
    pub fn append(
        &self,
        actor: &str,
        action: &str,
        envelope_sha: &str,
    ) -> Result<u64, ComplianceError> {
        let mut guard = self.writer.lock();
        if guard.is_none() {
            let next_seq = Self::recover_next_seq(&self.path)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| {
                    ComplianceError::AuditWriteFailed(format!(
                        "open {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
            tracing::info!(path = %self.path.display(), next_seq, "audit log opened");
            *guard = Some(Writer { file, next_seq });
        }

        let writer = guard.as_mut().expect("writer initialized above");
        let record = AuditRecord {
            seq: writer.next_seq,
            ts: Utc::now(),
            monotonic: self.clock.elapsed_s(),
            actor: actor.to_string(),
            action: action.to_string(),
            envelope_sha: envelope_sha.to_string(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        writer
            .file
            .write_all(&line)
            .and_then(|_| writer.file.flush())
            .map_err(|e| ComplianceError::AuditWriteFailed(e.to_string()))?;
        writer.next_seq += 1;
        Ok(record.seq)
    }

    fn recover_next_seq(path: &Path) -> Result<u64, ComplianceError> {
        if !path.exists() {
            return Ok(0);
        }
        let records = Self::read_records(path)?;
        Ok(records.last().map(|r| r.seq + 1).unwrap_or(0))
    }

    /// Read and validate the whole log: every line parses and sequence
    /// numbers strictly increase.
    pub fn read_records(path: &Path) -> Result<Vec<AuditRecord>, ComplianceError> {
        let file = File::open(path)
            .map_err(|e| ComplianceError::AuditWriteFailed(format!("read: {}", e)))?;
        let mut records = Vec::new();
        let mut last_seq: Option<u64> = None;
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line =
                line.map_err(|e| ComplianceError::AuditWriteFailed(format!("read: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line).map_err(|e| {
                ComplianceError::AuditWriteFailed(format!("line {}: {}", i + 1, e))
            })?;
            if let Some(last) = last_seq {
                if record.seq <= last {
                    return Err(ComplianceError::AuditWriteFailed(format!(
                        "line {}: sequence {} does not increase past {}",
                        i + 1,
                        record.seq,
                        last
                    )));
                }
            }
            last_seq = Some(record.seq);
            records.push(record);
        }
        Ok(records)
    }
}

static GLOBAL_AUDIT: OnceCell<AuditLog> = OnceCell::new();

/// Process-wide audit log. The path of the first caller wins; later calls
/// reuse the open log regardless of their path argument.
pub fn global_audit(path: impl Into<PathBuf>) -> &'static AuditLog {
    GLOBAL_AUDIT.get_or_init(|| AuditLog::new(path))
}

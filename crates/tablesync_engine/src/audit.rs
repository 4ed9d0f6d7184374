//! Audit log of finished runs.

use crate::error::SyncResult;
use crate::report::RunReport;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Receives every finished [`RunReport`].
///
/// A failing sink never fails the run; the orchestrator logs and moves on.
pub trait AuditSink: Send + Sync {
    /// Records a report.
    fn record(&self, report: &RunReport) -> SyncResult<()>;
}

/// Keeps reports in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    reports: Mutex<Vec<RunReport>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded reports, oldest first.
    pub fn reports(&self) -> Vec<RunReport> {
        self.reports.lock().clone()
    }

    /// Number of recorded reports.
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, report: &RunReport) -> SyncResult<()> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

/// Appends one JSON object per report to a file.
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
    file: Mutex<()>,
}

impl JsonLinesAuditSink {
    /// Creates a sink writing to `path`; the file is created on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(()),
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record(&self, report: &RunReport) -> SyncResult<()> {
        let mut line = serde_json::to_string(report)
            .map_err(tablesync_protocol::ProtocolError::from)?;
        line.push('\n');

        let _guard = self.file.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

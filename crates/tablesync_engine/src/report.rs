//! Run reports.

use crate::choices::DropdownFieldInfo;
use crate::detector::DetectionCounts;
use crate::error::{ErrorKind, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tablesync_protocol::{ConflictKind, RowId, Side};
use uuid::Uuid;

/// Orchestrator phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Listing both endpoints and normalizing rows.
    Fetching,
    /// Classifying rows against the checkpoint.
    DetectingConflicts,
    /// Applying the conflict policy.
    ResolvingConflicts,
    /// Writing record-side changes to the spreadsheet.
    WritingLeftToRight,
    /// Writing spreadsheet-side changes to the records.
    WritingRightToLeft,
    /// Deriving the new checkpoint.
    UpdatingCheckpoint,
    /// Run finished.
    Done,
}

impl SyncPhase {
    /// Every phase that produces a [`PhaseReport`], in order.
    pub const REPORTED: [SyncPhase; 6] = [
        SyncPhase::Fetching,
        SyncPhase::DetectingConflicts,
        SyncPhase::ResolvingConflicts,
        SyncPhase::WritingLeftToRight,
        SyncPhase::WritingRightToLeft,
        SyncPhase::UpdatingCheckpoint,
    ];

    /// Returns the phase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Fetching => "fetching",
            SyncPhase::DetectingConflicts => "detecting_conflicts",
            SyncPhase::ResolvingConflicts => "resolving_conflicts",
            SyncPhase::WritingLeftToRight => "writing_left_to_right",
            SyncPhase::WritingRightToLeft => "writing_right_to_left",
            SyncPhase::UpdatingCheckpoint => "updating_checkpoint",
            SyncPhase::Done => "done",
        }
    }

    /// Returns true for the two write phases.
    pub fn is_write(&self) -> bool {
        matches!(self, SyncPhase::WritingLeftToRight | SyncPhase::WritingRightToLeft)
    }

    /// Error kind assigned to failures that carry no kind of their own.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            SyncPhase::Fetching => ErrorKind::Fetch,
            SyncPhase::DetectingConflicts | SyncPhase::UpdatingCheckpoint => ErrorKind::State,
            SyncPhase::ResolvingConflicts => ErrorKind::Conflict,
            SyncPhase::WritingLeftToRight | SyncPhase::WritingRightToLeft => ErrorKind::Write,
            SyncPhase::Done => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Completed without errors.
    Succeeded,
    /// Completed with some errors.
    PartiallySucceeded,
    /// Could not do its work.
    Failed,
    /// Not executed.
    Skipped,
}

/// One error recorded by a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseError {
    /// Classification.
    pub kind: ErrorKind,
    /// Affected row, when the error concerns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_id: Option<RowId>,
    /// Human readable description.
    pub message: String,
}

impl PhaseError {
    /// Creates an error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            row_id: None,
            message: message.into(),
        }
    }

    /// Attaches a row id.
    pub fn with_row(mut self, row_id: RowId) -> Self {
        self.row_id = Some(row_id);
        self
    }

    /// Captures a [`SyncError`], classifying it against the phase.
    pub fn from_error(phase: SyncPhase, err: &SyncError) -> Self {
        Self {
            kind: err.kind_or(phase.error_kind()),
            row_id: err.row_id().cloned(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.row_id {
            Some(id) => write!(f, "[{}] row {}: {}", self.kind, id, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// Timing, errors and warnings of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    /// The phase.
    pub phase: SyncPhase,
    /// Outcome.
    pub status: PhaseStatus,
    /// Wall time spent in the phase.
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    /// Errors, each with a kind and optionally a row.
    #[serde(default)]
    pub errors: Vec<PhaseError>,
    /// Degraded-path notes that did not fail anything.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl PhaseReport {
    /// A phase that did not run.
    pub fn skipped(phase: SyncPhase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Skipped,
            duration: Duration::ZERO,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// A phase that did not run, with a note saying why.
    pub fn skipped_because(phase: SyncPhase, reason: impl Into<String>) -> Self {
        let mut report = Self::skipped(phase);
        report.warnings.push(reason.into());
        report
    }

    /// Returns true if the phase recorded errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Rows written in one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCounts {
    /// Rows created on the destination.
    pub added: usize,
    /// Rows updated on the destination.
    pub updated: usize,
    /// Rows deleted on the destination.
    pub deleted: usize,
}

impl WriteCounts {
    /// Total rows written.
    pub fn total(&self) -> usize {
        self.added + self.updated + self.deleted
    }
}

/// Conflicts by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCounts {
    /// Conflicts won by the record side.
    pub left_won: usize,
    /// Conflicts won by the spreadsheet side.
    pub right_won: usize,
    /// Conflicts that could not be resolved.
    pub unresolved: usize,
}

impl ConflictCounts {
    /// Total conflicts.
    pub fn total(&self) -> usize {
        self.left_won + self.right_won + self.unresolved
    }
}

/// How one conflict was decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionLogEntry {
    /// Row identifier.
    pub row_id: RowId,
    /// How the conflict arose.
    pub kind: ConflictKind,
    /// Surviving side.
    pub winner: Side,
    /// Whether the surviving side deleted the row.
    pub deleted: bool,
    /// Why that side won.
    pub rationale: String,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No phase recorded an error.
    Success,
    /// Some work was done, some failed or the run was cancelled.
    Partial,
    /// Fetching failed; nothing was written.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        })
    }
}

/// Everything a caller needs to know about one run.
///
/// Always produced, whatever the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Configuration that was synced.
    pub config_id: String,
    /// Overall outcome.
    pub status: RunStatus,
    /// Whether the run stopped early on request.
    #[serde(default)]
    pub cancelled: bool,
    /// One report per phase, in execution order.
    pub phases: Vec<PhaseReport>,
    /// Detector bucket sizes.
    #[serde(default)]
    pub detection: DetectionCounts,
    /// Rows written record → spreadsheet.
    #[serde(default)]
    pub left_to_right: WriteCounts,
    /// Rows written spreadsheet → record.
    #[serde(default)]
    pub right_to_left: WriteCounts,
    /// Conflicts by outcome.
    #[serde(default)]
    pub conflicts: ConflictCounts,
    /// Every conflict decision.
    #[serde(default)]
    pub resolutions: Vec<ResolutionLogEntry>,
    /// Dropdown fields found in the record schema.
    #[serde(default)]
    pub choice_fields: Vec<DropdownFieldInfo>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Total run time.
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

impl RunReport {
    /// Creates a report for a run that is starting.
    pub fn start(config_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            config_id: config_id.into(),
            status: RunStatus::Success,
            cancelled: false,
            phases: Vec::new(),
            detection: DetectionCounts::default(),
            left_to_right: WriteCounts::default(),
            right_to_left: WriteCounts::default(),
            conflicts: ConflictCounts::default(),
            resolutions: Vec::new(),
            choice_fields: Vec::new(),
            started_at,
            finished_at: started_at,
            duration: Duration::ZERO,
        }
    }

    /// Report of a phase.
    pub fn phase(&self, phase: SyncPhase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Status of a phase; `Skipped` if it has no report.
    pub fn phase_status(&self, phase: SyncPhase) -> PhaseStatus {
        self.phase(phase)
            .map_or(PhaseStatus::Skipped, |p| p.status)
    }

    /// All errors with the phase that recorded them.
    pub fn errors(&self) -> impl Iterator<Item = (SyncPhase, &PhaseError)> {
        self.phases
            .iter()
            .flat_map(|p| p.errors.iter().map(move |e| (p.phase, e)))
    }

    /// All warnings with the phase that recorded them.
    pub fn warnings(&self) -> impl Iterator<Item = (SyncPhase, &str)> {
        self.phases
            .iter()
            .flat_map(|p| p.warnings.iter().map(move |w| (p.phase, w.as_str())))
    }

    /// Number of errors across all phases.
    pub fn error_count(&self) -> usize {
        self.phases.iter().map(|p| p.errors.len()).sum()
    }

    /// Rows written in both directions.
    pub fn total_writes(&self) -> usize {
        self.left_to_right.total() + self.right_to_left.total()
    }

    /// Derives the overall status from the phase reports.
    pub(crate) fn settle(&mut self) {
        self.status = if self.phase_status(SyncPhase::Fetching) == PhaseStatus::Failed {
            RunStatus::Failed
        } else if self.cancelled || self.phases.iter().any(PhaseReport::has_errors) {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };
    }

    /// One-line summary for logs and terminals.
    pub fn summary(&self) -> String {
        format!(
            "run {} of {}: {} ({} written, {} conflicts, {} errors, {} ms)",
            self.run_id,
            self.config_id,
            self.status,
            self.total_writes(),
            self.conflicts.total(),
            self.error_count(),
            self.duration.as_millis()
        )
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

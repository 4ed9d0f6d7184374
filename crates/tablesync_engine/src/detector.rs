//! Change classification against the last checkpoint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tablesync_protocol::{
    Checkpoint, ConflictKind, ConflictRecord, ContentHash, RowId, Snapshot, SnapshotRow,
};
use tracing::debug;

/// How one side of a row moved since the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    None,
    Added,
    Updated,
    Deleted,
    Absent,
}

fn change(stored: Option<&ContentHash>, current: Option<&SnapshotRow>) -> Change {
    match (stored, current) {
        (None, None) => Change::Absent,
        (None, Some(_)) => Change::Added,
        (Some(_), None) => Change::Deleted,
        (Some(hash), Some(row)) if row.hash == *hash => Change::None,
        (Some(_), Some(_)) => Change::Updated,
    }
}

/// Rows bucketed by what changed where.
///
/// Every row id seen in either snapshot or the checkpoint lands in exactly
/// one bucket. Buckets are sorted by row id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// Same on both sides as at the checkpoint, or identical on both sides.
    pub unchanged: Vec<RowId>,
    /// New on the record side only.
    pub left_added: Vec<RowId>,
    /// Edited on the record side only.
    pub left_updated: Vec<RowId>,
    /// Deleted on the record side only.
    pub left_deleted: Vec<RowId>,
    /// New on the spreadsheet side only.
    pub right_added: Vec<RowId>,
    /// Edited on the spreadsheet side only.
    pub right_updated: Vec<RowId>,
    /// Deleted on the spreadsheet side only.
    pub right_deleted: Vec<RowId>,
    /// Changed on both sides; needs resolution.
    pub both_changed: Vec<ConflictRecord>,
    /// Deleted on both sides.
    pub both_deleted: Vec<RowId>,
}

impl Detection {
    /// Bucket sizes.
    pub fn counts(&self) -> DetectionCounts {
        DetectionCounts {
            unchanged: self.unchanged.len(),
            left_added: self.left_added.len(),
            left_updated: self.left_updated.len(),
            left_deleted: self.left_deleted.len(),
            right_added: self.right_added.len(),
            right_updated: self.right_updated.len(),
            right_deleted: self.right_deleted.len(),
            both_changed: self.both_changed.len(),
            both_deleted: self.both_deleted.len(),
        }
    }

    /// Returns true if nothing needs writing.
    pub fn is_quiet(&self) -> bool {
        let counts = self.counts();
        counts.total() == counts.unchanged + counts.both_deleted
    }
}

/// Bucket sizes of a [`Detection`], as reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionCounts {
    /// Unchanged rows.
    pub unchanged: usize,
    /// Rows added on the record side.
    pub left_added: usize,
    /// Rows updated on the record side.
    pub left_updated: usize,
    /// Rows deleted on the record side.
    pub left_deleted: usize,
    /// Rows added on the spreadsheet side.
    pub right_added: usize,
    /// Rows updated on the spreadsheet side.
    pub right_updated: usize,
    /// Rows deleted on the spreadsheet side.
    pub right_deleted: usize,
    /// Conflicts.
    pub both_changed: usize,
    /// Rows deleted on both sides.
    pub both_deleted: usize,
}

impl DetectionCounts {
    /// Total number of classified rows.
    pub fn total(&self) -> usize {
        self.unchanged
            + self.left_added
            + self.left_updated
            + self.left_deleted
            + self.right_added
            + self.right_updated
            + self.right_deleted
            + self.both_changed
            + self.both_deleted
    }
}

/// Classifies rows of two snapshots relative to a checkpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Creates a detector.
    pub fn new() -> Self {
        Self
    }

    /// Buckets every row id of `left`, `right` and `checkpoint`.
    ///
    /// Snapshots must be in canonical form so that hashes are comparable
    /// across sides.
    pub fn detect(&self, checkpoint: &Checkpoint, left: &Snapshot, right: &Snapshot) -> Detection {
        let ids: BTreeSet<&RowId> = left
            .ids()
            .chain(right.ids())
            .chain(checkpoint.entries.keys())
            .collect();

        let mut detection = Detection::default();
        for id in ids {
            let entry = checkpoint.get(id);
            let current_left = left.get(id);
            let current_right = right.get(id);
            let l = change(entry.map(|e| &e.left_hash), current_left);
            let r = change(entry.map(|e| &e.right_hash), current_right);

            let conflict = |kind| {
                ConflictRecord::new(
                    id.clone(),
                    kind,
                    current_left.map(|s| s.row.clone()),
                    current_right.map(|s| s.row.clone()),
                )
            };

            match (l, r) {
                (Change::Added, Change::Added) => {
                    if same_content(current_left, current_right) {
                        detection.unchanged.push(id.clone());
                    } else {
                        detection
                            .both_changed
                            .push(conflict(ConflictKind::FirstSyncCollision));
                    }
                }
                (Change::Added, _) => detection.left_added.push(id.clone()),
                (_, Change::Added) => detection.right_added.push(id.clone()),
                (Change::None, Change::None) => detection.unchanged.push(id.clone()),
                (Change::Updated, Change::None) => detection.left_updated.push(id.clone()),
                (Change::Deleted, Change::None) => detection.left_deleted.push(id.clone()),
                (Change::None, Change::Updated) => detection.right_updated.push(id.clone()),
                (Change::None, Change::Deleted) => detection.right_deleted.push(id.clone()),
                (Change::Deleted, Change::Deleted) => detection.both_deleted.push(id.clone()),
                (Change::Updated, Change::Updated) => {
                    if same_content(current_left, current_right) {
                        detection.unchanged.push(id.clone());
                    } else {
                        detection.both_changed.push(conflict(ConflictKind::BothUpdated));
                    }
                }
                (Change::Updated, Change::Deleted) | (Change::Deleted, Change::Updated) => {
                    detection.both_changed.push(conflict(ConflictKind::UpdateDelete));
                }
                // An id comes from a snapshot or the checkpoint, so it cannot
                // be absent from all three.
                (Change::Absent, _) | (_, Change::Absent) => {}
            }
        }

        debug!(counts = ?detection.counts(), "classified rows");
        detection
    }
}

fn same_content(left: Option<&SnapshotRow>, right: Option<&SnapshotRow>) -> bool {
    matches!((left, right), (Some(l), Some(r)) if l.hash == r.hash)
}

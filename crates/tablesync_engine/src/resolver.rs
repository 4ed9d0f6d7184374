//! Policy-driven conflict resolution.

use crate::error::{SyncError, SyncResult};
use tablesync_protocol::{ConflictPolicy, ConflictRecord, Resolution, Side};

/// Decides which side of a conflict survives.
///
/// Pure: the resolver reads the two candidates and returns a [`Resolution`].
/// It never writes rows and never touches the checkpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Creates a resolver.
    pub fn new() -> Self {
        Self
    }

    /// Applies `policy` to a conflict.
    ///
    /// A winner without a row means the winner deleted it. A conflict with
    /// no candidate at all is an invariant violation.
    pub fn resolve(&self, conflict: &ConflictRecord, policy: ConflictPolicy) -> SyncResult<Resolution> {
        if conflict.left.is_none() && conflict.right.is_none() {
            return Err(SyncError::Conflict(format!(
                "conflict on {} has no candidate rows",
                conflict.row_id
            )));
        }

        let (winner, rationale) = match policy {
            ConflictPolicy::LeftWins => (Side::Left, "policy left_wins".to_string()),
            ConflictPolicy::RightWins => (Side::Right, "policy right_wins".to_string()),
            ConflictPolicy::NewestWins => newest(conflict),
        };

        Ok(Resolution {
            winner,
            row: conflict.candidate(winner).cloned(),
            rationale,
        })
    }

    /// Resolves a conflict in place.
    pub fn resolve_in_place(
        &self,
        conflict: &mut ConflictRecord,
        policy: ConflictPolicy,
    ) -> SyncResult<()> {
        let resolution = self.resolve(conflict, policy)?;
        conflict.resolve(resolution);
        Ok(())
    }
}

fn newest(conflict: &ConflictRecord) -> (Side, String) {
    let left = conflict.left.as_ref().and_then(|r| r.modified_at);
    let right = conflict.right.as_ref().and_then(|r| r.modified_at);
    match (left, right) {
        (Some(l), Some(r)) if r > l => (
            Side::Right,
            format!("newest_wins: right modified {} after left {}", r.to_rfc3339(), l.to_rfc3339()),
        ),
        (Some(l), Some(r)) if l > r => (
            Side::Left,
            format!("newest_wins: left modified {} after right {}", l.to_rfc3339(), r.to_rfc3339()),
        ),
        (Some(_), Some(_)) => (
            Side::Left,
            "newest_wins: equal timestamps, left by default".to_string(),
        ),
        _ => (
            Side::Left,
            "newest_wins: timestamp missing, left by default".to_string(),
        ),
    }
}

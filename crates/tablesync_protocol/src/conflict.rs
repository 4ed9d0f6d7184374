//! Conflict records and resolution policies.

use crate::row::{Row, RowId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The record endpoint.
    Left,
    /// The spreadsheet endpoint.
    Right,
}

impl Side {
    /// Returns the opposite side.
    pub fn other(&self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => f.write_str("left"),
            Side::Right => f.write_str("right"),
        }
    }
}

/// Policy for rows changed on both sides since the last checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The record endpoint always wins.
    #[default]
    LeftWins,
    /// The spreadsheet endpoint always wins.
    RightWins,
    /// The most recently modified side wins; ties go left.
    NewestWins,
}

impl ConflictPolicy {
    /// Returns the policy name as used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::LeftWins => "left_wins",
            ConflictPolicy::RightWins => "right_wins",
            ConflictPolicy::NewestWins => "newest_wins",
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "left_wins" => Ok(ConflictPolicy::LeftWins),
            "right_wins" => Ok(ConflictPolicy::RightWins),
            "newest_wins" => Ok(ConflictPolicy::NewestWins),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// How a row came to be changed on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides edited the row.
    BothUpdated,
    /// One side edited the row, the other deleted it.
    UpdateDelete,
    /// No checkpoint entry and the two sides disagree.
    FirstSyncCollision,
}

/// The decided outcome of a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Side whose version survives.
    pub winner: Side,
    /// The surviving row; `None` means the winner deleted it.
    pub row: Option<Row>,
    /// Why this side won, for the run report.
    pub rationale: String,
}

/// A row changed on both sides since the last checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    /// Row identifier.
    pub row_id: RowId,
    /// How the conflict arose.
    pub kind: ConflictKind,
    /// Current canonical row on the record endpoint, if it still exists.
    pub left: Option<Row>,
    /// Current canonical row on the spreadsheet endpoint, if it still exists.
    pub right: Option<Row>,
    /// Resolution, once decided.
    pub resolution: Option<Resolution>,
}

impl ConflictRecord {
    /// Creates an unresolved conflict.
    pub fn new(row_id: RowId, kind: ConflictKind, left: Option<Row>, right: Option<Row>) -> Self {
        Self {
            row_id,
            kind,
            left,
            right,
            resolution: None,
        }
    }

    /// Returns the candidate row of a side.
    pub fn candidate(&self, side: Side) -> Option<&Row> {
        match side {
            Side::Left => self.left.as_ref(),
            Side::Right => self.right.as_ref(),
        }
    }

    /// Records the resolution.
    pub fn resolve(&mut self, resolution: Resolution) {
        self.resolution = Some(resolution);
    }

    /// Returns true once a resolution is recorded.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_other() {
        assert_eq!(Side::Left.other(), Side::Right);
        assert_eq!(Side::Right.other(), Side::Left);
        assert_eq!(Side::Left.to_string(), "left");
    }

    #[test]
    fn policy_names() {
        for policy in [
            ConflictPolicy::LeftWins,
            ConflictPolicy::RightWins,
            ConflictPolicy::NewestWins,
        ] {
            assert_eq!(policy.as_str().parse::<ConflictPolicy>().unwrap(), policy);
        }
        assert_eq!(
            "Newest-Wins".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::NewestWins
        );
        assert!("manual".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn conflict_candidates() {
        let mut conflict = ConflictRecord::new(
            "r1".into(),
            ConflictKind::UpdateDelete,
            Some(Row::new("r1")),
            None,
        );
        assert!(conflict.candidate(Side::Left).is_some());
        assert!(conflict.candidate(Side::Right).is_none());
        assert!(!conflict.is_resolved());

        conflict.resolve(Resolution {
            winner: Side::Right,
            row: None,
            rationale: "right_wins policy".into(),
        });
        assert!(conflict.is_resolved());
    }
}

//! Sync configuration.

use crate::conflict::ConflictPolicy;
use crate::error::ProtocolResult;
use crate::mapping::FieldMapping;
use serde::{Deserialize, Serialize};

/// Which way rows flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Record endpoint to spreadsheet only.
    #[default]
    LeftToRight,
    /// Spreadsheet to record endpoint only.
    RightToLeft,
    /// Both ways, with conflict resolution.
    Bidirectional,
}

impl SyncDirection {
    /// Returns true if left changes are written to the right.
    pub fn writes_left_to_right(&self) -> bool {
        matches!(self, SyncDirection::LeftToRight | SyncDirection::Bidirectional)
    }

    /// Returns true if right changes are written to the left.
    pub fn writes_right_to_left(&self) -> bool {
        matches!(self, SyncDirection::RightToLeft | SyncDirection::Bidirectional)
    }

    /// Returns true for bidirectional sync.
    pub fn is_bidirectional(&self) -> bool {
        matches!(self, SyncDirection::Bidirectional)
    }
}

/// One pairing of a record table with a spreadsheet.
///
/// Owned by the caller and immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    /// Stable configuration id; checkpoints are keyed by it.
    pub id: String,
    /// Field mapping.
    pub mapping: FieldMapping,
    /// Sync direction.
    #[serde(default)]
    pub direction: SyncDirection,
    /// Conflict policy, used only for bidirectional sync.
    #[serde(default)]
    pub policy: ConflictPolicy,
    /// Inactive configurations are not synced.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl SyncConfiguration {
    /// Creates an active left-to-right configuration.
    pub fn new(id: impl Into<String>, mapping: FieldMapping) -> Self {
        Self {
            id: id.into(),
            mapping,
            direction: SyncDirection::default(),
            policy: ConflictPolicy::default(),
            active: true,
        }
    }

    /// Sets the direction.
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Sets the conflict policy.
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the active flag.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Validates the mapping.
    pub fn validate(&self) -> ProtocolResult<()> {
        self.mapping.validate()
    }
}

//! Persisted state of the last successful sync run.

use crate::error::{ProtocolError, ProtocolResult};
use crate::hash::ContentHash;
use crate::row::RowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Checkpoint format version written by this build.
pub const CHECKPOINT_VERSION: u32 = 1;

/// What the last run knew about one row on each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Canonical content hash on the record endpoint.
    pub left_hash: ContentHash,
    /// Canonical content hash on the spreadsheet endpoint.
    pub right_hash: ContentHash,
    /// Last known modification time on the record endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_modified: Option<DateTime<Utc>>,
    /// Last known modification time on the spreadsheet endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_modified: Option<DateTime<Utc>>,
}

impl CheckpointEntry {
    /// Entry for a row whose content is identical on both sides.
    pub fn in_sync(
        hash: ContentHash,
        left_modified: Option<DateTime<Utc>>,
        right_modified: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            left_hash: hash,
            right_hash: hash,
            left_modified,
            right_modified,
        }
    }
}

/// Per-configuration baseline for change detection.
///
/// A checkpoint always describes one whole prior run. The engine never edits
/// the caller's checkpoint; it derives a new one and hands it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Format version.
    pub version: u32,
    /// Configuration this checkpoint belongs to.
    pub config_id: String,
    /// Wall-clock time the checkpoint was taken; `None` if never synced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<DateTime<Utc>>,
    /// Known rows.
    #[serde(default)]
    pub entries: BTreeMap<RowId, CheckpointEntry>,
}

impl Checkpoint {
    /// Creates an empty checkpoint for a configuration.
    pub fn empty(config_id: impl Into<String>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            config_id: config_id.into(),
            taken_at: None,
            entries: BTreeMap::new(),
        }
    }

    /// Looks up an entry.
    pub fn get(&self, id: &RowId) -> Option<&CheckpointEntry> {
        self.entries.get(id)
    }

    /// Inserts or replaces an entry.
    pub fn insert(&mut self, id: RowId, entry: CheckpointEntry) {
        self.entries.insert(id, entry);
    }

    /// Removes an entry.
    pub fn remove(&mut self, id: &RowId) -> Option<CheckpointEntry> {
        self.entries.remove(id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no rows are recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks that this checkpoint can serve as the baseline for `config_id`.
    pub fn validate_for(&self, config_id: &str) -> ProtocolResult<()> {
        if self.version != CHECKPOINT_VERSION {
            return Err(ProtocolError::UnsupportedCheckpointVersion {
                found: self.version,
                supported: CHECKPOINT_VERSION,
            });
        }
        if self.config_id != config_id {
            return Err(ProtocolError::CheckpointMismatch {
                expected: config_id.to_string(),
                found: self.config_id.clone(),
            });
        }
        Ok(())
    }

    /// Encodes to pretty-printed JSON.
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decodes from JSON.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

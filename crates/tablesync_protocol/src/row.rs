//! Rows and row snapshots.

use crate::hash::ContentHash;
use crate::value::FieldValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a logical row, shared by both endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    /// Creates a row id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RowId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A logical record from either endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Row identifier.
    pub id: RowId,
    /// Field values keyed by field name (or column letter on the spreadsheet side).
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    /// Last modification time, when the endpoint reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Row {
    /// Creates an empty row.
    pub fn new(id: impl Into<RowId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
            modified_at: None,
        }
    }

    /// Sets a field value.
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Sets the modification time.
    pub fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    /// Returns a field value.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Hash of this row's content.
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of_fields(&self.fields)
    }
}

/// A row together with its content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    /// The canonical row.
    pub row: Row,
    /// Hash of `row.fields`.
    pub hash: ContentHash,
}

/// The rows one endpoint holds at fetch time, in canonical form.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    rows: BTreeMap<RowId, SnapshotRow>,
}

impl Snapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a row, hashing it.
    ///
    /// Returns the rejected row if the id is already present; the first
    /// occurrence wins.
    pub fn insert(&mut self, row: Row) -> Result<(), Row> {
        if self.rows.contains_key(&row.id) {
            return Err(row);
        }
        let hash = row.content_hash();
        self.rows.insert(row.id.clone(), SnapshotRow { row, hash });
        Ok(())
    }

    /// Looks up a row.
    pub fn get(&self, id: &RowId) -> Option<&SnapshotRow> {
        self.rows.get(id)
    }

    /// Returns true if the row is present.
    pub fn contains(&self, id: &RowId) -> bool {
        self.rows.contains_key(id)
    }

    /// Iterates over row ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &RowId> {
        self.rows.keys()
    }

    /// Iterates over rows in id order.
    pub fn iter(&self) -> impl Iterator<Item = &SnapshotRow> {
        self.rows.values()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl FromIterator<Row> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for row in iter {
            let _ = snapshot.insert(row);
        }
        snapshot
    }
}

//! Test fixtures.
//!
//! Rows built here are in canonical form: keyed by field id, the way the
//! record endpoint stores them. Use [`sheet_rows`] for the spreadsheet side.

use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use tablesync_protocol::{
    Checkpoint, CheckpointEntry, FieldMapEntry, FieldMapping, FieldValue, Row, RowId,
};
use tempfile::TempDir;

/// Linked table used by [`people_mapping`].
pub const TEAMS_TABLE: &str = "Teams";

/// Mapping `fldName → A`, `fldEmail → B`, `fldStatus → C`.
pub fn plain_mapping() -> FieldMapping {
    FieldMapping::new(vec![
        FieldMapEntry::new("fldName", 0),
        FieldMapEntry::new("fldEmail", 1),
        FieldMapEntry::new("fldStatus", 2),
    ])
}

/// [`plain_mapping`] plus `fldTeam → D`, linked to [`TEAMS_TABLE`].
pub fn people_mapping() -> FieldMapping {
    let mut entries = plain_mapping().entries().to_vec();
    entries.push(FieldMapEntry::new("fldTeam", 3).linked(TEAMS_TABLE, true));
    FieldMapping::new(entries)
}

/// A person row with name and email.
pub fn person(id: &str, name: &str, email: &str) -> Row {
    Row::new(id)
        .with_field("fldName", FieldValue::Text(name.to_string()))
        .with_field("fldEmail", FieldValue::Text(email.to_string()))
}

/// A person row with a status dropdown value.
pub fn person_with_status(id: &str, name: &str, status: &str) -> Row {
    person(id, name, &format!("{}@example.com", name.to_lowercase()))
        .with_field("fldStatus", FieldValue::Choice(status.to_string()))
}

/// `count` people with ids `r01`, `r02`, ...
pub fn numbered_people(count: usize) -> Vec<Row> {
    (1..=count)
        .map(|i| {
            person(
                &format!("r{i:02}"),
                &format!("Person {i}"),
                &format!("person{i}@example.com"),
            )
        })
        .collect()
}

/// Converts canonical rows into spreadsheet rows.
pub fn sheet_rows(mapping: &FieldMapping, rows: &[Row]) -> Vec<Row> {
    rows.iter().map(|row| mapping.to_columns(row)).collect()
}

/// Returns `row` with one field replaced.
pub fn with_value(row: &Row, field: &str, value: FieldValue) -> Row {
    row.clone().with_field(field, value)
}

/// A checkpoint recording `rows` as in sync on both sides.
pub fn checkpoint_of(config_id: &str, rows: &[Row]) -> Checkpoint {
    let mut checkpoint = Checkpoint::empty(config_id);
    checkpoint.taken_at = Some(ts(0));
    for row in rows {
        checkpoint.insert(
            row.id.clone(),
            CheckpointEntry::in_sync(row.content_hash(), row.modified_at, row.modified_at),
        );
    }
    checkpoint
}

/// Ids of `rows`, sorted.
pub fn ids_of(rows: &[Row]) -> Vec<RowId> {
    let mut ids: Vec<RowId> = rows.iter().map(|r| r.id.clone()).collect();
    ids.sort();
    ids
}

/// Wall time `secs` seconds after the Unix epoch.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// A temporary state directory removed on drop.
pub struct TempStateDir {
    dir: TempDir,
}

impl TempStateDir {
    /// Creates a new temporary directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// The directory path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of a file inside the directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl Default for TempStateDir {
    fn default() -> Self {
        Self::new()
    }
}

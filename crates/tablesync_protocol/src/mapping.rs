//! Mapping between record field ids and spreadsheet columns.
//!
//! Rows from the record endpoint are keyed by field id. Rows from the
//! spreadsheet endpoint are keyed by column letter (`A`, `B`, ..., `Z`, `AA`).
//! Before comparison both are projected into the *canonical* form: field-id
//! keys, mapped fields only, normalized values.

use crate::error::{ProtocolError, ProtocolResult};
use crate::row::Row;
use crate::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Returns the spreadsheet letter for a zero-based column index.
pub fn column_label(index: u32) -> String {
    let mut n = u64::from(index) + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        letters.push(char::from(b'A' + rem));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Parses a spreadsheet column letter into a zero-based index.
pub fn column_index(label: &str) -> ProtocolResult<u32> {
    if label.is_empty() {
        return Err(ProtocolError::InvalidColumn(label.to_string()));
    }
    let mut n: u64 = 0;
    for c in label.chars() {
        let upper = c.to_ascii_uppercase();
        if !upper.is_ascii_uppercase() {
            return Err(ProtocolError::InvalidColumn(label.to_string()));
        }
        n = n * 26 + u64::from(upper as u8 - b'A' + 1);
        if n > u64::from(u32::MAX) {
            return Err(ProtocolError::InvalidColumn(label.to_string()));
        }
    }
    u32::try_from(n - 1).map_err(|_| ProtocolError::InvalidColumn(label.to_string()))
}

/// Marks a field as a cross-reference into another table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Foreign table the field links to.
    pub table: String,
    /// Create missing target rows when writing labels back as links.
    #[serde(default)]
    pub create_missing: bool,
}

/// One mapped field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapEntry {
    /// Field id on the record endpoint.
    pub field_id: String,
    /// Zero-based column index on the spreadsheet endpoint.
    pub column: u32,
    /// Cross-reference settings for linked-record fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkSpec>,
}

impl FieldMapEntry {
    /// Creates a plain mapping entry.
    pub fn new(field_id: impl Into<String>, column: u32) -> Self {
        Self {
            field_id: field_id.into(),
            column,
            link: None,
        }
    }

    /// Marks the entry as a link into `table`.
    pub fn linked(mut self, table: impl Into<String>, create_missing: bool) -> Self {
        self.link = Some(LinkSpec {
            table: table.into(),
            create_missing,
        });
        self
    }

    /// Column letter of this entry.
    pub fn column_label(&self) -> String {
        column_label(self.column)
    }
}

/// Field-id to column mapping of one sync configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping {
    entries: Vec<FieldMapEntry>,
}

impl FieldMapping {
    /// Creates a mapping from entries.
    pub fn new(entries: Vec<FieldMapEntry>) -> Self {
        Self { entries }
    }

    /// All entries in declaration order.
    pub fn entries(&self) -> &[FieldMapEntry] {
        &self.entries
    }

    /// Entries that link to another table.
    pub fn linked_entries(&self) -> impl Iterator<Item = (&FieldMapEntry, &LinkSpec)> {
        self.entries
            .iter()
            .filter_map(|e| e.link.as_ref().map(|link| (e, link)))
    }

    /// Looks up the entry for a field id.
    pub fn entry(&self, field_id: &str) -> Option<&FieldMapEntry> {
        self.entries.iter().find(|e| e.field_id == field_id)
    }

    /// Column index of a field, if mapped.
    pub fn column_for(&self, field_id: &str) -> Option<u32> {
        self.entry(field_id).map(|e| e.column)
    }

    /// Entry mapped to a column, if any.
    pub fn entry_for_column(&self, column: u32) -> Option<&FieldMapEntry> {
        self.entries.iter().find(|e| e.column == column)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks that the mapping is non-empty and one-to-one.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.entries.is_empty() {
            return Err(ProtocolError::InvalidMapping("no fields are mapped".into()));
        }
        let mut fields = HashSet::new();
        let mut columns = HashSet::new();
        for entry in &self.entries {
            if entry.field_id.trim().is_empty() {
                return Err(ProtocolError::InvalidMapping("empty field id".into()));
            }
            if !fields.insert(entry.field_id.as_str()) {
                return Err(ProtocolError::InvalidMapping(format!(
                    "field {} is mapped twice",
                    entry.field_id
                )));
            }
            if !columns.insert(entry.column) {
                return Err(ProtocolError::InvalidMapping(format!(
                    "column {} is mapped twice",
                    entry.column_label()
                )));
            }
        }
        Ok(())
    }

    /// Projects a record-endpoint row into canonical form.
    ///
    /// Linked fields keep whatever references the row holds; turning ids into
    /// labels needs a cross-reference lookup and is left to the caller.
    pub fn project_left(&self, row: &Row) -> Row {
        let fields = self
            .entries
            .iter()
            .filter_map(|entry| {
                let value = row.fields.get(&entry.field_id)?;
                canonical_value(entry, value).map(|v| (entry.field_id.clone(), v))
            })
            .collect();
        Row {
            id: row.id.clone(),
            fields,
            modified_at: row.modified_at,
        }
    }

    /// Projects a spreadsheet row into canonical form.
    ///
    /// Cells in unmapped columns and keys that are not column letters are
    /// ignored.
    pub fn project_right(&self, row: &Row) -> Row {
        let fields = row
            .fields
            .iter()
            .filter_map(|(key, value)| {
                let column = column_index(key).ok()?;
                let entry = self.entry_for_column(column)?;
                canonical_value(entry, value).map(|v| (entry.field_id.clone(), v))
            })
            .collect();
        Row {
            id: row.id.clone(),
            fields,
            modified_at: row.modified_at,
        }
    }

    /// Turns a canonical row into a spreadsheet row keyed by column letter.
    pub fn to_columns(&self, row: &Row) -> Row {
        let fields: BTreeMap<String, FieldValue> = self
            .entries
            .iter()
            .filter_map(|entry| {
                row.fields
                    .get(&entry.field_id)
                    .map(|v| (entry.column_label(), v.clone()))
            })
            .collect();
        Row {
            id: row.id.clone(),
            fields,
            modified_at: row.modified_at,
        }
    }
}

fn canonical_value(entry: &FieldMapEntry, value: &FieldValue) -> Option<FieldValue> {
    let value = value.normalized()?;
    if entry.link.is_some() {
        // Spreadsheets render links as text; bring them back to a list.
        return FieldValue::Links(value.as_items()).normalized();
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> FieldMapping {
        FieldMapping::new(vec![
            FieldMapEntry::new("fldName", 0),
            FieldMapEntry::new("fldStatus", 1),
            FieldMapEntry::new("fldOwner", 2).linked("people", true),
        ])
    }

    #[test]
    fn column_labels() {
        assert_eq!(column_label(0), "A");
        assert_eq!(column_label(25), "Z");
        assert_eq!(column_label(26), "AA");
        assert_eq!(column_label(27), "AB");
        assert_eq!(column_label(701), "ZZ");
        assert_eq!(column_label(702), "AAA");
    }

    #[test]
    fn column_indexes() {
        assert_eq!(column_index("A").unwrap(), 0);
        assert_eq!(column_index("aa").unwrap(), 26);
        assert_eq!(column_index("ZZ").unwrap(), 701);
        assert!(column_index("").is_err());
        assert!(column_index("A1").is_err());
        for i in [0, 1, 25, 26, 51, 52, 700, 18_277] {
            assert_eq!(column_index(&column_label(i)).unwrap(), i);
        }
    }

    #[test]
    fn validate_rejects_duplicates() {
        assert!(mapping().validate().is_ok());
        assert!(FieldMapping::default().validate().is_err());

        let dup_column = FieldMapping::new(vec![
            FieldMapEntry::new("a", 0),
            FieldMapEntry::new("b", 0),
        ]);
        assert!(dup_column.validate().is_err());

        let dup_field = FieldMapping::new(vec![
            FieldMapEntry::new("a", 0),
            FieldMapEntry::new("a", 1),
        ]);
        assert!(dup_field.validate().is_err());
    }

    #[test]
    fn left_and_right_projections_agree() {
        let mapping = mapping();
        let left = Row::new("r1")
            .with_field("fldName", FieldValue::Text("Ada ".into()))
            .with_field("fldStatus", FieldValue::Choice("Open".into()))
            .with_field("fldOwner", FieldValue::Links(vec!["Grace".into()]))
            .with_field("fldUnmapped", FieldValue::Number(1.0));
        let right = Row::new("r1")
            .with_field("A", FieldValue::Text("Ada".into()))
            .with_field("B", FieldValue::Text("Open".into()))
            .with_field("C", FieldValue::Text("Grace".into()))
            .with_field("Z", FieldValue::Text("ignored".into()));

        let left = mapping.project_left(&left);
        let right = mapping.project_right(&right);
        assert!(!left.fields.contains_key("fldUnmapped"));
        assert_eq!(left.content_hash(), right.content_hash());
    }

    #[test]
    fn to_columns_uses_letters() {
        let mapping = mapping();
        let canonical = Row::new("r1")
            .with_field("fldName", FieldValue::Text("Ada".into()))
            .with_field("fldOwner", FieldValue::Links(vec!["Grace".into()]));
        let columns = mapping.to_columns(&canonical);
        assert_eq!(columns.field("A"), Some(&FieldValue::Text("Ada".into())));
        assert_eq!(
            columns.field("C"),
            Some(&FieldValue::Links(vec!["Grace".into()]))
        );
        assert_eq!(mapping.project_right(&columns), canonical);
    }

    #[test]
    fn mapping_serializes_as_list() {
        let json = serde_json::to_value(mapping()).unwrap();
        assert!(json.is_array());
        assert_eq!(json[2]["link"]["table"], "people");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn column_letters_round_trip(index in 0u32..200_000) {
                let label = column_label(index);
                prop_assert!(label.chars().all(|c| c.is_ascii_uppercase()));
                prop_assert_eq!(column_index(&label).unwrap(), index);
                prop_assert_eq!(column_index(&label.to_lowercase()).ok(), Some(index));
            }

            #[test]
            fn column_order_follows_index(a in 0u32..20_000, b in 0u32..20_000) {
                let (la, lb) = (column_label(a), column_label(b));
                let by_letters = (la.len(), la).cmp(&(lb.len(), lb));
                prop_assert_eq!(by_letters, a.cmp(&b));
            }
        }
    }
}

//! Dropdown (choice field) detection.
//!
//! The record endpoint declares choice sets in its schema. The spreadsheet
//! side has no schema of its own, so the engine reports which columns should
//! carry dropdown validation and checks outgoing values against the sets.

use serde::{Deserialize, Serialize};
use tablesync_protocol::{column_label, FieldMapping, FieldType, FieldValue, SchemaField};
use tracing::warn;

/// Where a dropdown's column index came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnSource {
    /// An explicit field mapping entry.
    Mapping,
    /// The field's position in the schema.
    Position,
}

/// A choice field and the column that should validate against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropdownFieldInfo {
    /// Field id on the record side.
    pub field_id: String,
    /// Field display name.
    pub field_name: String,
    /// Zero-based destination column.
    pub column: u32,
    /// How `column` was determined.
    pub column_source: ColumnSource,
    /// Declared choices.
    pub choices: Vec<String>,
    /// Single choice: the value must be exactly one choice.
    pub strict: bool,
    /// Multi choice: the value may be any comma separated subset.
    pub multiple: bool,
}

impl DropdownFieldInfo {
    /// Spreadsheet column letter.
    pub fn column_label(&self) -> String {
        column_label(self.column)
    }

    /// Checks a value against the choice set.
    ///
    /// Returns the offending items on mismatch. Matching is exact.
    pub fn validate(&self, value: &FieldValue) -> Result<(), Vec<String>> {
        let items = if self.strict {
            match value {
                FieldValue::Text(s) | FieldValue::Choice(s) => vec![s.trim().to_string()],
                other => other.as_items(),
            }
        } else {
            value.as_items()
        };

        if self.strict && items.len() > 1 {
            return Err(items);
        }

        let invalid: Vec<String> = items
            .into_iter()
            .filter(|item| !item.is_empty() && !self.choices.contains(item))
            .collect();
        if invalid.is_empty() {
            Ok(())
        } else {
            Err(invalid)
        }
    }
}

/// Result of inspecting a schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChoiceInspection {
    /// Detected dropdown fields, in schema order.
    pub fields: Vec<DropdownFieldInfo>,
    /// Skipped fields and positional fallbacks.
    pub warnings: Vec<String>,
}

impl ChoiceInspection {
    /// Dropdown for a field id.
    pub fn field(&self, field_id: &str) -> Option<&DropdownFieldInfo> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }
}

/// Extracts dropdown definitions from a record schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChoiceFieldInspector;

impl ChoiceFieldInspector {
    /// Creates an inspector.
    pub fn new() -> Self {
        Self
    }

    /// Detects choice fields and assigns each a destination column.
    ///
    /// A field absent from `mapping` falls back to its position in
    /// `schema_fields`, which is only right when the spreadsheet mirrors the
    /// schema's field order; each fallback is reported as a warning.
    pub fn detect(&self, schema_fields: &[SchemaField], mapping: &FieldMapping) -> ChoiceInspection {
        let mut inspection = ChoiceInspection::default();

        for (position, field) in schema_fields.iter().enumerate() {
            if !field.field_type.is_choice() {
                continue;
            }
            if field.choices.is_empty() {
                let message = format!(
                    "choice field {} ({}) declares no choices; skipped",
                    field.name, field.id
                );
                warn!(field_id = %field.id, "choice field without choices");
                inspection.warnings.push(message);
                continue;
            }

            let (column, column_source) = match mapping.column_for(&field.id) {
                Some(column) => (column, ColumnSource::Mapping),
                None => {
                    let column = u32::try_from(position).unwrap_or(u32::MAX);
                    warn!(
                        field_id = %field.id,
                        column,
                        "choice field not mapped, using schema position"
                    );
                    inspection.warnings.push(format!(
                        "choice field {} ({}) is not mapped; assuming column {} from schema position",
                        field.name,
                        field.id,
                        column_label(column)
                    ));
                    (column, ColumnSource::Position)
                }
            };

            let multiple = field.field_type == FieldType::MultipleSelects;
            inspection.fields.push(DropdownFieldInfo {
                field_id: field.id.clone(),
                field_name: field.name.clone(),
                column,
                column_source,
                choices: field.choices.clone(),
                strict: !multiple,
                multiple,
            });
        }

        inspection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::FieldMapEntry;

    fn schema() -> Vec<SchemaField> {
        vec![
            SchemaField::new("fldName", "Name", FieldType::Text),
            SchemaField::new("fldStatus", "Status", FieldType::SingleSelect)
                .with_choices(["Todo", "Doing", "Done"]),
            SchemaField::new("fldTags", "Tags", FieldType::MultipleSelects)
                .with_choices(["red", "green", "blue"]),
            SchemaField::new("fldEmpty", "Empty", FieldType::SingleSelect),
        ]
    }

    #[test]
    fn detects_choice_fields_with_mapped_columns() {
        let mapping = FieldMapping::new(vec![
            FieldMapEntry::new("fldName", 0),
            FieldMapEntry::new("fldStatus", 4),
            FieldMapEntry::new("fldTags", 5),
        ]);
        let inspection = ChoiceFieldInspector::new().detect(&schema(), &mapping);

        assert_eq!(inspection.fields.len(), 2);
        let status = inspection.field("fldStatus").unwrap();
        assert_eq!(status.column, 4);
        assert_eq!(status.column_label(), "E");
        assert!(status.strict && !status.multiple);
        assert_eq!(status.column_source, ColumnSource::Mapping);

        let tags = inspection.field("fldTags").unwrap();
        assert!(tags.multiple && !tags.strict);

        // Only the empty choice field is reported.
        assert_eq!(inspection.warnings.len(), 1);
        assert!(inspection.warnings[0].contains("fldEmpty"));
    }

    #[test]
    fn unmapped_fields_fall_back_to_position() {
        let mapping = FieldMapping::new(vec![FieldMapEntry::new("fldStatus", 1)]);
        let inspection = ChoiceFieldInspector::new().detect(&schema(), &mapping);

        let tags = inspection.field("fldTags").unwrap();
        assert_eq!(tags.column, 2);
        assert_eq!(tags.column_source, ColumnSource::Position);
        assert!(inspection
            .warnings
            .iter()
            .any(|w| w.contains("fldTags") && w.contains("schema position")));
    }

    #[test]
    fn strict_validation() {
        let inspection = ChoiceFieldInspector::new().detect(&schema(), &FieldMapping::default());
        let status = inspection.field("fldStatus").unwrap();

        assert!(status.validate(&FieldValue::Choice("Done".into())).is_ok());
        assert!(status.validate(&FieldValue::Text(" Todo ".into())).is_ok());
        assert_eq!(
            status.validate(&FieldValue::Choice("done".into())),
            Err(vec!["done".to_string()])
        );
        assert!(status
            .validate(&FieldValue::TextList(vec!["Todo".into(), "Done".into()]))
            .is_err());
    }

    #[test]
    fn permissive_validation() {
        let inspection = ChoiceFieldInspector::new().detect(&schema(), &FieldMapping::default());
        let tags = inspection.field("fldTags").unwrap();

        assert!(tags.validate(&FieldValue::Text("red, blue".into())).is_ok());
        assert!(tags
            .validate(&FieldValue::TextList(vec!["green".into()]))
            .is_ok());
        assert_eq!(
            tags.validate(&FieldValue::Text("red, purple".into())),
            Err(vec!["purple".to_string()])
        );
    }
}

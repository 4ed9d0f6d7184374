//! Choices command implementation.

use crate::files::{read_json, EndpointFile};
use serde::Serialize;
use std::path::Path;
use tablesync_engine::{ChoiceFieldInspector, ColumnSource, DropdownFieldInfo};
use tablesync_protocol::SyncConfiguration;

/// Detected dropdown fields.
#[derive(Debug, Serialize)]
pub struct ChoicesResult {
    /// Configuration id.
    pub config_id: String,
    /// Dropdown fields with their destination columns.
    pub fields: Vec<DropdownFieldInfo>,
    /// Detection notes.
    pub warnings: Vec<String>,
}

/// Runs the choices command.
pub fn run(config: &Path, left: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = detect(config, left)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text(&result),
    }
    Ok(())
}

/// Detects dropdown fields in a record endpoint file's schema.
pub fn detect(config: &Path, left: &Path) -> Result<ChoicesResult, Box<dyn std::error::Error>> {
    let config: SyncConfiguration = read_json(config)?;
    let file = EndpointFile::load(left)?;
    if file.schema.fields.is_empty() {
        return Err(format!("No schema found in {:?}", left).into());
    }

    let inspection = ChoiceFieldInspector::new().detect(&file.schema.fields, &config.mapping);
    Ok(ChoicesResult {
        config_id: config.id,
        fields: inspection.fields,
        warnings: inspection.warnings,
    })
}

fn print_text(result: &ChoicesResult) {
    println!("Dropdown fields for {}", result.config_id);
    println!();

    if result.fields.is_empty() {
        println!("  (none)");
    }
    for field in &result.fields {
        let source = match field.column_source {
            ColumnSource::Mapping => "mapped",
            ColumnSource::Position => "by position",
        };
        let kind = if field.multiple { "multi" } else { "single" };
        println!(
            "  {} ({}) -> column {} [{}, {}]",
            field.field_name,
            field.field_id,
            field.column_label(),
            source,
            kind
        );
        println!("    choices: {}", field.choices.join(", "));
    }

    for warning in &result.warnings {
        println!("warning: {warning}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::write_json;
    use tablesync_protocol::{FieldType, Schema, SchemaField};
    use tablesync_testkit::{plain_mapping, TempStateDir};

    #[test]
    fn detects_mapped_and_positional_fields() {
        let dir = TempStateDir::new();
        let config = SyncConfiguration::new("people", plain_mapping());
        write_json(&dir.file("config.json"), &config).unwrap();

        let schema = Schema::new(vec![
            SchemaField::new("fldName", "Name", FieldType::Text),
            SchemaField::new("fldEmail", "Email", FieldType::Text),
            SchemaField::new("fldStatus", "Status", FieldType::SingleSelect)
                .with_choices(["Todo", "Done"]),
            SchemaField::new("fldTags", "Tags", FieldType::MultipleSelects)
                .with_choices(["a", "b"]),
        ]);
        let file = EndpointFile {
            schema,
            rows: Vec::new(),
        };
        file.save(&dir.file("left.json")).unwrap();

        let result = detect(&dir.file("config.json"), &dir.file("left.json")).unwrap();
        assert_eq!(result.fields.len(), 2);

        let status = &result.fields[0];
        assert_eq!(status.field_id, "fldStatus");
        assert_eq!(status.column_label(), "C");
        assert_eq!(status.column_source, ColumnSource::Mapping);

        let tags = &result.fields[1];
        assert_eq!(tags.column_source, ColumnSource::Position);
        assert!(tags.multiple);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn empty_schema_is_an_error() {
        let dir = TempStateDir::new();
        let config = SyncConfiguration::new("people", plain_mapping());
        write_json(&dir.file("config.json"), &config).unwrap();
        assert!(detect(&dir.file("config.json"), &dir.file("left.json")).is_err());
    }
}

//! Endpoint schema description.

use serde::{Deserialize, Serialize};

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Single or multi line text.
    Text,
    /// Numeric field.
    Number,
    /// Checkbox.
    Checkbox,
    /// Calendar date.
    Date,
    /// Exactly one value out of a choice set.
    SingleSelect,
    /// Any subset of a choice set.
    MultipleSelects,
    /// Links to rows of another table.
    LinkedRecords,
    /// File attachments.
    Attachment,
    /// Anything the engine does not interpret.
    Other,
}

impl FieldType {
    /// Returns true for single- and multi-choice fields.
    pub fn is_choice(&self) -> bool {
        matches!(self, FieldType::SingleSelect | FieldType::MultipleSelects)
    }
}

/// One field of an endpoint schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Stable field id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Declared type.
    pub field_type: FieldType,
    /// Declared choices for choice fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

impl SchemaField {
    /// Creates a field without choices.
    pub fn new(id: impl Into<String>, name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            field_type,
            choices: Vec::new(),
        }
    }

    /// Sets the choice set.
    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }
}

/// Schema of one endpoint table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Fields in declaration order.
    pub fields: Vec<SchemaField>,
}

impl Schema {
    /// Creates a schema from fields.
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    /// Looks up a field by id.
    pub fn field(&self, id: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.id == id)
    }
}

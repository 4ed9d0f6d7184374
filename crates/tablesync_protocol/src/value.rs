//! Typed field values.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A reference to a file attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Download URL.
    pub url: String,
    /// Original file name.
    pub filename: String,
}

/// The value of one field of a row.
///
/// Endpoint clients normalize whatever their API returns into one of these
/// variants before rows reach the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Free text.
    Text(String),
    /// A number.
    Number(f64),
    /// A checkbox.
    Boolean(bool),
    /// A calendar date.
    Date(NaiveDate),
    /// One value out of an enumerated choice set.
    Choice(String),
    /// A list of text values (multi-choice fields, tags).
    TextList(Vec<String>),
    /// References to rows of another table, as ids or labels.
    Links(Vec<String>),
    /// File attachments.
    Attachments(Vec<Attachment>),
}

impl FieldValue {
    /// Returns the normalized form of this value, or `None` if it is empty.
    ///
    /// Text is trimmed, empty strings and empty lists disappear. Two values
    /// that normalize to the same thing are the same value for sync purposes.
    pub fn normalized(&self) -> Option<FieldValue> {
        match self {
            FieldValue::Text(s) => non_empty(s).map(FieldValue::Text),
            FieldValue::Choice(s) => non_empty(s).map(FieldValue::Choice),
            FieldValue::TextList(items) => {
                non_empty_list(items).map(FieldValue::TextList)
            }
            FieldValue::Links(items) => non_empty_list(items).map(FieldValue::Links),
            FieldValue::Attachments(items) if items.is_empty() => None,
            FieldValue::Number(n) if n.is_nan() => None,
            other => Some(other.clone()),
        }
    }

    /// Untagged JSON form used for hashing.
    ///
    /// Text, choices and dates all become strings and both list kinds become
    /// arrays, so a spreadsheet that renders a choice as plain text still
    /// hashes the same as the record it was written from.
    pub fn canonical_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FieldValue::Text(s) | FieldValue::Choice(s) => Value::String(s.clone()),
            FieldValue::Number(n) => Value::from(*n),
            FieldValue::Boolean(b) => Value::Bool(*b),
            FieldValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            FieldValue::TextList(items) | FieldValue::Links(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            FieldValue::Attachments(items) => Value::Array(
                items
                    .iter()
                    .map(|a| {
                        serde_json::json!({ "url": a.url, "filename": a.filename })
                    })
                    .collect(),
            ),
        }
    }

    /// Returns the textual items of this value.
    ///
    /// Comma separated text is split, so a spreadsheet cell `"a, b"` yields
    /// `["a", "b"]`.
    pub fn as_items(&self) -> Vec<String> {
        match self {
            FieldValue::Text(s) | FieldValue::Choice(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            FieldValue::TextList(items) | FieldValue::Links(items) => items.clone(),
            FieldValue::Number(n) => vec![n.to_string()],
            FieldValue::Boolean(b) => vec![b.to_string()],
            FieldValue::Date(d) => vec![d.format("%Y-%m-%d").to_string()],
            FieldValue::Attachments(items) => {
                items.iter().map(|a| a.filename.clone()).collect()
            }
        }
    }

    /// Short name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Number(_) => "number",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Date(_) => "date",
            FieldValue::Choice(_) => "choice",
            FieldValue::TextList(_) => "text_list",
            FieldValue::Links(_) => "links",
            FieldValue::Attachments(_) => "attachments",
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn non_empty_list(items: &[String]) -> Option<Vec<String>> {
    let items: Vec<String> = items.iter().filter_map(|s| non_empty(s)).collect();
    (!items.is_empty()).then_some(items)
}

//! JSON files read and written by the CLI.
//!
//! An endpoint file holds one table:
//!
//! ```json
//! { "schema": { "fields": [...] }, "rows": [ { "id": "r1", "fields": {...} } ] }
//! ```
//!
//! A links file maps table names to their rows:
//!
//! ```json
//! { "Teams": [ { "id": "recEng", "label": "Engineering" } ] }
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use tablesync_engine::{LinkedLabel, MemoryEndpoint, MemoryLinkedTables};
use tablesync_protocol::{Row, Schema};

/// Contents of an endpoint file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EndpointFile {
    /// Table schema; only meaningful for the record endpoint.
    #[serde(default)]
    pub schema: Schema,
    /// Stored rows.
    #[serde(default)]
    pub rows: Vec<Row>,
}

impl EndpointFile {
    /// Loads an endpoint file; a missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Self::default());
        }
        read_json(path)
    }

    /// Builds an in-memory endpoint holding this file's rows.
    pub fn into_endpoint(self, name: &str) -> MemoryEndpoint {
        MemoryEndpoint::new(name)
            .with_schema(self.schema)
            .with_rows(self.rows)
    }

    /// Captures an endpoint's current state.
    pub fn from_endpoint(endpoint: &MemoryEndpoint) -> Self {
        Self {
            schema: endpoint.schema(),
            rows: endpoint.rows(),
        }
    }

    /// Writes the file, replacing it atomically.
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        write_json(path, self)
    }
}

#[derive(Debug, Deserialize)]
struct LinkRow {
    id: String,
    label: String,
}

/// Loads a links file into in-memory linked tables.
pub fn load_links(path: &Path) -> Result<MemoryLinkedTables, Box<dyn std::error::Error>> {
    let tables: BTreeMap<String, Vec<LinkRow>> = read_json(path)?;
    let linked = MemoryLinkedTables::new();
    for (table, rows) in tables {
        for row in rows {
            linked.insert(&table, row.id, row.label);
        }
    }
    Ok(linked)
}

/// Serializes linked tables back to the links file layout.
pub fn links_json(
    linked: &MemoryLinkedTables,
    tables: &[String],
) -> BTreeMap<String, Vec<serde_json::Value>> {
    tables
        .iter()
        .map(|table| {
            let rows = linked
                .labels(table)
                .into_iter()
                .map(|LinkedLabel { id, label }| {
                    serde_json::json!({ "id": id.as_str(), "label": label })
                })
                .collect();
            (table.clone(), rows)
        })
        .collect()
}

/// Reads and decodes a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let json = fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let value = serde_json::from_str(&json)
        .map_err(|e| format!("invalid JSON in {}: {e}", path.display()))?;
    Ok(value)
}

/// Encodes a value as pretty JSON and swaps it into place.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(value)?;
    let temp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp_path, path)?;
    Ok(())
}

//! # tablesync Protocol
//!
//! Data model shared by the tablesync engine and its clients.
//!
//! This crate provides:
//! - `Row` and the typed `FieldValue` union
//! - `FieldMapping` between record field ids and spreadsheet columns
//! - `ContentHash` over the canonical form of a row
//! - `Checkpoint` describing the last successful run
//! - `ConflictRecord`, `ConflictPolicy` and `Resolution`
//! - `SyncConfiguration` and `SyncDirection`
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod checkpoint;
mod config;
mod conflict;
mod error;
mod hash;
mod mapping;
mod row;
mod schema;
mod value;

pub use checkpoint::{Checkpoint, CheckpointEntry, CHECKPOINT_VERSION};
pub use config::{SyncConfiguration, SyncDirection};
pub use conflict::{ConflictKind, ConflictPolicy, ConflictRecord, Resolution, Side};
pub use error::{ProtocolError, ProtocolResult};
pub use hash::ContentHash;
pub use mapping::{column_index, column_label, FieldMapEntry, FieldMapping, LinkSpec};
pub use row::{Row, RowId, Snapshot, SnapshotRow};
pub use schema::{FieldType, Schema, SchemaField};
pub use value::{Attachment, FieldValue};

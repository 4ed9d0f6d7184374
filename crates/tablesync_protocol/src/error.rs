//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or decoding protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The field mapping is unusable.
    #[error("invalid field mapping: {0}")]
    InvalidMapping(String),

    /// The checkpoint belongs to a different configuration.
    #[error("checkpoint belongs to configuration {found:?}, expected {expected:?}")]
    CheckpointMismatch {
        /// Configuration the caller is syncing.
        expected: String,
        /// Configuration recorded in the checkpoint.
        found: String,
    },

    /// The checkpoint was written by an incompatible format version.
    #[error("unsupported checkpoint version {found} (supported: {supported})")]
    UnsupportedCheckpointVersion {
        /// Version found in the checkpoint.
        found: u32,
        /// Version this build understands.
        supported: u32,
    },

    /// A content hash could not be parsed.
    #[error("invalid content hash: {0}")]
    InvalidHash(String),

    /// A spreadsheet column reference could not be parsed.
    #[error("invalid column reference: {0}")]
    InvalidColumn(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

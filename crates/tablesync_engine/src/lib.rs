//! # tablesync Engine
//!
//! Keeps a record-based cloud database table (the *left* endpoint) and a
//! spreadsheet tab (the *right* endpoint) in agreement.
//!
//! This crate provides:
//! - Sync orchestrator (fetch → detect → resolve → write → checkpoint)
//! - Three-way change detection against a checkpoint
//! - Conflict resolution by policy
//! - Per-service rate limiting and retry with exponential backoff
//! - Linked-record translation with a TTL cache
//! - Dropdown field detection and validation
//! - Checkpoint stores and run audit sinks
//!
//! ## Architecture
//!
//! Endpoints are reached through the [`EndpointClient`] trait. Every call
//! goes through an [`ApiGuard`], which paces it against the service's rate
//! limit and retries transient failures. Rows are projected into a
//! canonical, field-id keyed form before they are hashed and compared, so
//! both sides are always compared like for like.
//!
//! ## Key Invariants
//!
//! - A run always produces a report; phase failures never escape as errors
//! - The caller's checkpoint is never modified; a new one is returned
//! - Rows whose write failed keep their previous checkpoint entry
//! - Request starts to one service are spaced by its minimum interval

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used)]

mod audit;
mod cancel;
mod choices;
mod clock;
mod config;
mod crossref;
mod detector;
mod endpoint;
mod error;
mod orchestrator;
mod rate_limit;
mod report;
mod resolver;
mod retry;
mod store;

pub use audit::{AuditSink, JsonLinesAuditSink, MemoryAuditSink};
pub use cancel::CancellationToken;
pub use choices::{ChoiceFieldInspector, ChoiceInspection, ColumnSource, DropdownFieldInfo};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{EngineConfig, RateLimitConfig, RetryConfig};
pub use crossref::{
    normalize_label, CrossReferenceResolver, IdResolution, LabelResolution, ResolvedLink,
};
pub use detector::{ConflictDetector, Detection, DetectionCounts};
pub use endpoint::{
    fetch_all_rows, EndpointClient, EndpointOp, LinkedLabel, LinkedTableSource, MemoryEndpoint,
    MemoryLinkedTables, Pages, RowPage, RowSelector,
};
pub use error::{EndpointError, EndpointResult, ErrorKind, SyncError, SyncResult};
pub use orchestrator::{OrchestratorStats, SyncOrchestrator, SyncOutcome};
pub use rate_limit::{RateLimiter, RateLimiterStats};
pub use report::{
    ConflictCounts, PhaseError, PhaseReport, PhaseStatus, ResolutionLogEntry, RunReport,
    RunStatus, SyncPhase, WriteCounts,
};
pub use resolver::ConflictResolver;
pub use retry::{ApiGuard, RetryExecutor};
pub use store::{CheckpointStore, ConfigLock, FileCheckpointStore, MemoryCheckpointStore};

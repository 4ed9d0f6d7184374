//! # tablesync Testkit
//!
//! Test utilities for tablesync.
//!
//! This crate provides:
//! - Row, mapping and checkpoint fixtures
//! - Temporary state directories
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tablesync_testkit::prelude::*;
//!
//! #[test]
//! fn syncs_people() {
//!     let mapping = people_mapping();
//!     let rows = numbered_people(10);
//!     // ... run the orchestrator
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;

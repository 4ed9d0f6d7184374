//! CLI command implementations.

pub mod choices;
pub mod inspect_checkpoint;
pub mod run;

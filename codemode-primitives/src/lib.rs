//! Core shared types for the code-mode runtime.

#![warn(missing_docs, clippy::pedantic)]

mod capability;
mod error;
mod ids;
mod outcome;

/// Capability descriptors and supporting builders.
pub use capability::{Capability, CapabilityBuilder};
/// Error type and result alias shared across the workspace.
pub use error::{Error, Result};
/// Unique identifier attached to every snippet run.
pub use ids::RunId;
/// Structured `{result, logs}` pair produced by every run.
pub use outcome::ExecutionOutcome;

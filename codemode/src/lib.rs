//! Code mode: let an agent run one snippet that calls many capabilities.
//!
//! Register capabilities on a [`CodeModeClient`], hand an agent the
//! [`AGENT_PROMPT_TEMPLATE`] and the interface text from
//! [`CodeModeClient::describe_all`], then run the snippets it writes. Each
//! run returns an [`ExecutionOutcome`] holding the result and the captured
//! console lines; failures show up as `[ERROR] ` log lines, never as errors.
//!
//! The component crates are re-exported for callers that need the lower
//! layers directly.

#![warn(missing_docs, clippy::pedantic)]

mod client;
mod prompt;

pub use client::CodeModeClient;
pub use prompt::AGENT_PROMPT_TEMPLATE;

pub use codemode_primitives::{Capability, CapabilityBuilder, ExecutionOutcome, RunId};
pub use codemode_tools::{Args, CapabilityError, CapabilityFn, CapabilityResult};

/// Re-export shared primitives for convenience.
pub use codemode_primitives as primitives;

/// Capability registry and interface generation.
pub use codemode_tools as tools;

/// The embedded snippet language.
pub use codemode_script as script;

/// Namespace binding, output capture, timeouts and scheduling.
pub use codemode_kernel as kernel;

/// Engine configuration and loaders.
pub use codemode_config as config;

/// Tracing subscriber setup (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use codemode_telemetry as telemetry;

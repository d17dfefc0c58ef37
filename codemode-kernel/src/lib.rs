//! Snippet execution kernel.
//!
//! [`ExecutionEngine`] ties the pieces together: it snapshots the capability
//! registry into an [`ExecutionContext`], captures console output in a
//! [`LogBuffer`], enforces the timeout and turns every ending into an
//! [`ExecutionOutcome`](codemode_primitives::ExecutionOutcome).
//! [`RunScheduler`] bounds how many runs execute at once.

#![warn(missing_docs, clippy::pedantic)]

mod binder;
mod capture;
mod context;
mod engine;
mod scheduler;

pub use binder::{CapabilityForwarder, NamespaceBinder};
pub use capture::LogBuffer;
pub use context::{ExecutionContext, INTERFACE_LOOKUP_BINDING, INTERFACES_BINDING};
pub use engine::{DEFAULT_TIMEOUT, ExecutionEngine, ExecutionFault};
pub use scheduler::{DEFAULT_MAX_CONCURRENT_RUNS, RunScheduler, SchedulerError, SchedulerResult};

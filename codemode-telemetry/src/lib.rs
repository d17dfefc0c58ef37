//! Observability utilities for the code-mode runtime.
//!
//! Library crates only emit `tracing` events; binaries and tests call into
//! [`tracing_support`] once to install a subscriber.

#![warn(missing_docs, clippy::pedantic)]

pub mod tracing_support;

pub use tracing_support::{LogFormat, TelemetryConfig, init, try_init};

//! Capability registration and introspection.
//!
//! [`registry`] owns registered capabilities and their async backends;
//! [`interface`] renders their schemas as human-readable interface text for
//! snippet authors.

#![warn(missing_docs, clippy::pedantic)]

pub mod interface;
pub mod registry;

pub use interface::{InterfaceGenerator, binding_path, sanitize_identifier};
pub use registry::{Args, CapabilityError, CapabilityFn, CapabilityRegistry, CapabilityResult};

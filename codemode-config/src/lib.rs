//! Configuration management for the code-mode engine.
//!
//! [`schema`] holds the typed settings; [`loader`] reads them from TOML text,
//! files and `CODEMODE_*` environment variables.

#![warn(missing_docs, clippy::pedantic)]

pub mod loader;
pub mod schema;

pub use schema::EngineConfig;

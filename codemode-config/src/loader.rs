//! Configuration loader implementations.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::debug;

use crate::schema::EngineConfig;

/// Overrides [`EngineConfig::default_timeout_secs`].
pub const ENV_DEFAULT_TIMEOUT_SECS: &str = "CODEMODE_DEFAULT_TIMEOUT_SECS";
/// Overrides [`EngineConfig::max_concurrent_runs`].
pub const ENV_MAX_CONCURRENT_RUNS: &str = "CODEMODE_MAX_CONCURRENT_RUNS";
/// Overrides [`EngineConfig::recursion_limit`].
pub const ENV_RECURSION_LIMIT: &str = "CODEMODE_RECURSION_LIMIT";
/// Overrides [`EngineConfig::yield_interval`].
pub const ENV_YIELD_INTERVAL: &str = "CODEMODE_YIELD_INTERVAL";

/// Parses and validates a TOML document. Missing keys keep their defaults.
///
/// # Errors
///
/// Fails on malformed TOML, unknown keys, or values rejected by
/// [`EngineConfig::validate`].
pub fn from_toml_str(text: &str) -> Result<EngineConfig> {
    let config: EngineConfig = toml::from_str(text).context("failed to parse engine configuration")?;
    config.validate()?;
    Ok(config)
}

/// Reads and validates a TOML file.
///
/// # Errors
///
/// Fails when the file cannot be read or [`from_toml_str`] rejects it.
pub fn from_file(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    let config = from_toml_str(&text).with_context(|| format!("invalid configuration in {}", path.display()))?;
    debug!(path = %path.display(), "engine configuration loaded");
    Ok(config)
}

/// Builds a configuration from the defaults and the `CODEMODE_*` process
/// environment.
///
/// # Errors
///
/// Fails when a variable does not parse or the result is invalid.
pub fn from_env() -> Result<EngineConfig> {
    apply_overrides(EngineConfig::default(), |key| std::env::var(key).ok())
}

/// Replaces every field whose variable `lookup` resolves, then validates.
///
/// # Errors
///
/// Fails when a resolved value does not parse or the result is invalid.
pub fn apply_overrides<F>(mut config: EngineConfig, lookup: F) -> Result<EngineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(ENV_DEFAULT_TIMEOUT_SECS) {
        config.default_timeout_secs = parse(ENV_DEFAULT_TIMEOUT_SECS, &raw)?;
    }
    if let Some(raw) = lookup(ENV_MAX_CONCURRENT_RUNS) {
        config.max_concurrent_runs = parse(ENV_MAX_CONCURRENT_RUNS, &raw)?;
    }
    if let Some(raw) = lookup(ENV_RECURSION_LIMIT) {
        config.recursion_limit = parse(ENV_RECURSION_LIMIT, &raw)?;
    }
    if let Some(raw) = lookup(ENV_YIELD_INTERVAL) {
        config.yield_interval = parse(ENV_YIELD_INTERVAL, &raw)?;
    }
    config.validate()?;
    Ok(config)
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {key}: {raw:?}"))?;
    debug!(key, "configuration override applied");
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn toml_fills_missing_keys_with_defaults() {
        let config = from_toml_str("default_timeout_secs = 2.5\nrecursion_limit = 10\n").unwrap();
        assert!((config.default_timeout_secs - 2.5).abs() < f64::EPSILON);
        assert_eq!(config.recursion_limit, 10);
        assert_eq!(config.max_concurrent_runs, 32);
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        let err = from_toml_str("timeout = 3").unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn toml_values_are_validated() {
        assert!(from_toml_str("max_concurrent_runs = 0").is_err());
    }

    #[test]
    fn overrides_replace_resolved_fields() {
        let config = apply_overrides(
            EngineConfig::default(),
            lookup(&[(ENV_DEFAULT_TIMEOUT_SECS, " 0.5 "), (ENV_YIELD_INTERVAL, "64")]),
        )
        .unwrap();
        assert!((config.default_timeout_secs - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.yield_interval, 64);
        assert_eq!(config.recursion_limit, 64);
    }

    #[test]
    fn unparsable_override_names_the_variable() {
        let err = apply_overrides(EngineConfig::default(), lookup(&[(ENV_RECURSION_LIMIT, "deep")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_RECURSION_LIMIT));
    }

    #[test]
    fn missing_file_reports_its_path() {
        let err = from_file("/nonexistent/codemode.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/codemode.toml"));
    }
}

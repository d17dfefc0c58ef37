//! Strongly typed engine settings.

use std::time::Duration;

use anyhow::{Result, ensure};
use serde::Deserialize;

/// Tunables applied to every snippet run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Budget in seconds used when a run does not name its own timeout.
    pub default_timeout_secs: f64,
    /// Runs allowed to execute at the same time.
    pub max_concurrent_runs: usize,
    /// Maximum snippet function call depth.
    pub recursion_limit: usize,
    /// Loop iterations between cooperative yields.
    pub yield_interval: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30.0,
            max_concurrent_runs: 32,
            recursion_limit: 64,
            yield_interval: 1024,
        }
    }
}

impl EngineConfig {
    /// Checks every field against its allowed range.
    ///
    /// # Errors
    ///
    /// Fails when the timeout is not a positive finite number or a limit is
    /// zero.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.default_timeout_secs.is_finite() && self.default_timeout_secs > 0.0,
            "default_timeout_secs must be a positive number of seconds, got {}",
            self.default_timeout_secs
        );
        ensure!(self.max_concurrent_runs > 0, "max_concurrent_runs must be at least 1");
        ensure!(self.recursion_limit > 0, "recursion_limit must be at least 1");
        ensure!(self.yield_interval > 0, "yield_interval must be at least 1");
        Ok(())
    }

    /// The default timeout as a [`Duration`], zero when it is not
    /// representable.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.default_timeout_secs).unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_non_positive_timeouts() {
        for timeout in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = EngineConfig {
                default_timeout_secs: timeout,
                ..EngineConfig::default()
            };
            assert!(config.validate().is_err(), "{timeout} should be rejected");
        }
    }

    #[test]
    fn rejects_zero_run_limit() {
        let config = EngineConfig {
            max_concurrent_runs: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_runs"));
    }

    #[test]
    fn negative_timeout_converts_to_zero() {
        let config = EngineConfig {
            default_timeout_secs: -5.0,
            ..EngineConfig::default()
        };
        assert_eq!(config.default_timeout(), Duration::ZERO);
    }
}

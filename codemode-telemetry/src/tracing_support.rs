//! Structured tracing helpers.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Directive used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Line layout of emitted events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One event per line with all span context.
    #[default]
    Full,
    /// Shorter single-line layout.
    Compact,
}

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter directive applied when `RUST_LOG` is unset, such as
    /// `codemode_kernel=debug,info`.
    pub filter: String,
    /// Event layout.
    pub format: LogFormat,
    /// Colourise output.
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_DIRECTIVE.to_owned(),
            format: LogFormat::default(),
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Creates a config with the given default filter directive.
    #[must_use]
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            ..Self::default()
        }
    }

    /// Sets the event layout.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enables or disables colours.
    #[must_use]
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Builds the filter; `RUST_LOG` wins over the configured directive.
    ///
    /// # Errors
    ///
    /// Fails when the configured directive does not parse.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.filter)
            .with_context(|| format!("invalid log filter directive {:?}", self.filter))
    }
}

/// Installs the global `fmt` subscriber.
///
/// # Errors
///
/// Fails when the filter is invalid or a global subscriber is already set.
pub fn try_init(config: &TelemetryConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi);
    let installed = match config.format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Installs the global subscriber with `filter` as the default directive,
/// ignoring the error when one is already installed.
pub fn init(filter: &str) {
    if let Err(err) = try_init(&TelemetryConfig::new(filter)) {
        tracing::debug!(error = %err, "tracing subscriber not installed");
    }
}

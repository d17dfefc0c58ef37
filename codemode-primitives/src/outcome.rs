//! The structured outcome returned by every snippet run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result value plus the ordered console log of one run.
///
/// `result` is `None` when the snippet produced no value, raised, timed out,
/// or failed to compile. Diagnostic lines in `logs` carry an `[ERROR] ` prefix.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    result: Option<Value>,
    logs: Vec<String>,
}

impl ExecutionOutcome {
    /// Prefix applied to every diagnostic log line.
    pub const ERROR_PREFIX: &'static str = "[ERROR] ";

    /// Creates an outcome from its parts.
    #[must_use]
    pub fn new(result: Option<Value>, logs: Vec<String>) -> Self {
        Self { result, logs }
    }

    /// Creates a failed outcome: empty result, captured logs, and one trailing
    /// diagnostic line.
    #[must_use]
    pub fn failed(mut logs: Vec<String>, diagnostic: impl AsRef<str>) -> Self {
        logs.push(format!("{}{}", Self::ERROR_PREFIX, diagnostic.as_ref()));
        Self { result: None, logs }
    }

    /// Returns the computed result, if any.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Returns the captured log lines in arrival order.
    #[must_use]
    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    /// Returns `true` if any log line is a diagnostic.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.logs
            .iter()
            .any(|line| line.starts_with(Self::ERROR_PREFIX))
    }

    /// Splits the outcome into its result and logs.
    #[must_use]
    pub fn into_parts(self) -> (Option<Value>, Vec<String>) {
        (self.result, self.logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_appends_diagnostic() {
        let outcome = ExecutionOutcome::failed(vec!["partial".into()], "boom");
        assert!(outcome.result().is_none());
        assert_eq!(outcome.logs(), ["partial", "[ERROR] boom"]);
        assert!(outcome.has_errors());
    }

    #[test]
    fn serializes_as_result_and_logs() {
        let outcome = ExecutionOutcome::new(Some(json!(15)), Vec::new());
        let encoded = serde_json::to_value(&outcome).unwrap();
        assert_eq!(encoded, json!({ "result": 15, "logs": [] }));
    }
}

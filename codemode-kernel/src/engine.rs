//! Runs snippets and folds every way they can end into an [`ExecutionOutcome`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use codemode_primitives::{ExecutionOutcome, RunId};
use codemode_script::{Exception, Limits, OutputSink, ScriptEngine, SyntaxError, Value, to_json_lossy};
use codemode_tools::{CapabilityRegistry, InterfaceGenerator};
use futures::FutureExt;
use thiserror::Error;
use tracing::{Instrument, debug, info_span, warn};

use crate::capture::LogBuffer;
use crate::context::ExecutionContext;

/// Default wall-clock budget for one run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a run ended without a result.
///
/// The `Display` text is the diagnostic appended to the run's logs.
#[derive(Debug, Error)]
pub enum ExecutionFault {
    /// The snippet text is not valid code.
    #[error("Code execution failed: {source}")]
    Compile {
        /// Parser diagnostic.
        #[from]
        source: SyntaxError,
    },

    /// The run exceeded its wall-clock budget.
    #[error("Code execution timed out after {}s", .timeout.as_secs_f64())]
    Timeout {
        /// Budget that was exceeded.
        timeout: Duration,
    },

    /// The snippet raised and did not catch the exception.
    #[error("Code execution failed: {exception}")]
    Unhandled {
        /// Exception that escaped the snippet.
        exception: Exception,
    },

    /// A zero timeout was supplied.
    #[error("Code execution failed: timeout must be greater than zero")]
    InvalidTimeout,

    /// A capability backend or the interpreter panicked.
    #[error("Code execution failed: panic: {message}")]
    Panicked {
        /// Panic payload rendered as text.
        message: String,
    },
}

impl From<Exception> for ExecutionFault {
    fn from(exception: Exception) -> Self {
        Self::Unhandled { exception }
    }
}

/// Executes snippets against the capabilities of a registry.
///
/// Each run builds a fresh [`ExecutionContext`] and [`LogBuffer`], so
/// concurrent runs share nothing but the registry and the interface cache.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    registry: Arc<CapabilityRegistry>,
    interfaces: Arc<InterfaceGenerator>,
    script: ScriptEngine,
}

impl ExecutionEngine {
    /// Creates an engine over `registry`, rendering introspection text with
    /// `interfaces`.
    #[must_use]
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        interfaces: Arc<InterfaceGenerator>,
        limits: Limits,
    ) -> Self {
        Self {
            registry,
            interfaces,
            script: ScriptEngine::new(limits),
        }
    }

    /// Registry the engine snapshots at the start of every run.
    #[must_use]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Interface cache shared with the owning client.
    #[must_use]
    pub fn interfaces(&self) -> &Arc<InterfaceGenerator> {
        &self.interfaces
    }

    /// Limits applied to every snippet.
    #[must_use]
    pub const fn limits(&self) -> Limits {
        self.script.limits()
    }

    /// Runs `code` for at most `timeout`.
    ///
    /// Never fails: compile errors, uncaught exceptions, timeouts and panics
    /// all produce an outcome with an empty result and a trailing
    /// `[ERROR] ` line. Output captured before the failure is kept.
    pub async fn run(&self, code: &str, timeout: Duration) -> ExecutionOutcome {
        let run_id = RunId::random();
        let span = info_span!("snippet_run", run_id = %run_id);
        self.run_captured(code, timeout).instrument(span).await
    }

    async fn run_captured(&self, code: &str, timeout: Duration) -> ExecutionOutcome {
        let logs = Arc::new(LogBuffer::new());
        match self.execute(code, timeout, &logs).await {
            Ok(value) => {
                let outcome = ExecutionOutcome::new(value.as_ref().map(to_json_lossy), logs.take());
                debug!(lines = outcome.logs().len(), "snippet finished");
                outcome
            }
            Err(fault) => {
                match &fault {
                    ExecutionFault::Timeout { timeout } => {
                        warn!(timeout_secs = timeout.as_secs_f64(), "snippet timed out");
                    }
                    ExecutionFault::Panicked { message } => {
                        warn!(panic = %message, "snippet run panicked");
                    }
                    ExecutionFault::InvalidTimeout => warn!("snippet rejected: zero timeout"),
                    ExecutionFault::Compile { source } => {
                        debug!(line = source.line(), error = %source, "snippet failed to compile");
                    }
                    ExecutionFault::Unhandled { exception } => {
                        debug!(kind = %exception.kind(), error = %exception, "snippet raised");
                    }
                }
                ExecutionOutcome::failed(logs.take(), fault.to_string())
            }
        }
    }

    async fn execute(
        &self,
        code: &str,
        timeout: Duration,
        logs: &Arc<LogBuffer>,
    ) -> Result<Option<Value>, ExecutionFault> {
        if timeout.is_zero() {
            return Err(ExecutionFault::InvalidTimeout);
        }

        let context = ExecutionContext::build(&self.registry, &self.interfaces);
        debug!(capabilities = context.capability_count(), "snippet run starting");
        let program = self.script.compile(code)?;

        let sink: Arc<dyn OutputSink> = logs.clone();
        let execution = self
            .script
            .execute(&program, context.into_bindings(), sink);
        match tokio::time::timeout(timeout, AssertUnwindSafe(execution).catch_unwind()).await {
            Err(_elapsed) => Err(ExecutionFault::Timeout { timeout }),
            Ok(Err(payload)) => Err(ExecutionFault::Panicked {
                message: panic_message(payload.as_ref()),
            }),
            Ok(Ok(result)) => Ok(result?),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codemode_primitives::Capability;
    use codemode_tools::{Args, CapabilityError};
    use serde_json::{Value as Json, json};
    use std::sync::Mutex;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(
            Arc::new(CapabilityRegistry::new()),
            Arc::new(InterfaceGenerator::new()),
            Limits::default(),
        )
    }

    fn register<F, Fut>(engine: &ExecutionEngine, name: &str, backend: F)
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Json, CapabilityError>> + Send + 'static,
    {
        let capability = Capability::builder(name).description("test").build().unwrap();
        engine.registry().add_capability(capability, backend);
    }

    async fn run(engine: &ExecutionEngine, code: &str) -> ExecutionOutcome {
        engine.run(code, Duration::from_secs(5)).await
    }

    #[tokio::test]
    async fn returns_the_routine_value() {
        let outcome = run(&engine(), "x = 5\ny = 10\nreturn x + y").await;
        assert_eq!(outcome.result(), Some(&json!(15)));
        assert!(outcome.logs().is_empty());
    }

    #[tokio::test]
    async fn missing_return_yields_empty_result() {
        let outcome = run(&engine(), "x = 1").await;
        assert_eq!(outcome.result(), None);

        let outcome = run(&engine(), "return None").await;
        assert_eq!(outcome.result(), Some(&Json::Null));
    }

    #[tokio::test]
    async fn console_output_is_captured_in_order() {
        let code = r#"
            print("First log")
            print("Number:", 42)
            sys.stderr.write("careful\n")
        "#;
        let outcome = run(&engine(), code).await;
        assert_eq!(outcome.logs(), ["First log", "Number: 42", "[ERROR] careful"]);
    }

    #[tokio::test]
    async fn capability_round_trip_records_arguments() {
        let engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        register(&engine, "math.add", move |args: Args| {
            recorder.lock().unwrap().push(args.clone());
            async move {
                let a = args.get("a").and_then(Json::as_i64).unwrap_or_default();
                let b = args.get("b").and_then(Json::as_i64).unwrap_or_default();
                Ok(json!({ "sum": a + b }))
            }
        });

        let outcome = run(&engine, "return await math.add(a=2, b=3)").await;
        assert_eq!(outcome.result(), Some(&json!({ "sum": 5 })));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(Json::Object(seen[0].clone()), json!({ "a": 2, "b": 3 }));
    }

    #[tokio::test]
    async fn invocation_errors_are_catchable() {
        let engine = engine();
        register(&engine, "svc.fail", |_args: Args| async move {
            Err(CapabilityError::execution("backend down"))
        });

        let code = r#"
            try:
                await svc.fail()
            except CapabilityInvocationError as err:
                return {"error": str(err)}
        "#;
        let outcome = run(&engine, code).await;
        assert_eq!(
            outcome.result(),
            Some(&json!({ "error": "Error calling capability 'svc.fail': backend down" }))
        );
    }

    #[tokio::test]
    async fn unknown_capability_can_be_handled_by_the_snippet() {
        let engine = engine();
        register(&engine, "math.add", |_args: Args| async move { Ok(Json::Null) });

        let code = r#"
            try:
                await math.missing(x=1)
            except CapabilityNotFound:
                return {"error": True}
        "#;
        let outcome = run(&engine, code).await;
        assert_eq!(outcome.result(), Some(&json!({ "error": true })));
    }

    #[tokio::test]
    async fn uncaught_exceptions_become_diagnostics() {
        let outcome = run(&engine(), "print('before')\nraise ValueError('bad input')").await;
        assert_eq!(outcome.result(), None);
        assert_eq!(
            outcome.logs(),
            ["before", "[ERROR] Code execution failed: ValueError: bad input (line 2)"]
        );
    }

    #[tokio::test]
    async fn syntax_errors_become_diagnostics() {
        let outcome = run(&engine(), "return (1 +").await;
        assert_eq!(outcome.result(), None);
        assert!(outcome.has_errors());
        assert!(outcome.logs()[0].starts_with("[ERROR] Code execution failed: SyntaxError:"));
    }

    #[tokio::test]
    async fn timeouts_keep_earlier_output() {
        let code = r#"
            print("started")
            while True:
                await asyncio.sleep(0.01)
        "#;
        let outcome = engine().run(code, Duration::from_millis(100)).await;
        assert_eq!(outcome.result(), None);
        assert_eq!(
            outcome.logs(),
            ["started", "[ERROR] Code execution timed out after 0.1s"]
        );
    }

    #[tokio::test]
    async fn busy_loops_are_cancelled() {
        let outcome = engine()
            .run("while True:\n    pass", Duration::from_secs(1))
            .await;
        assert_eq!(outcome.logs(), ["[ERROR] Code execution timed out after 1s"]);
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let outcome = engine().run("return 1", Duration::ZERO).await;
        assert_eq!(
            outcome.logs(),
            ["[ERROR] Code execution failed: timeout must be greater than zero"]
        );
    }

    #[tokio::test]
    async fn backend_panics_are_contained() {
        let engine = engine();
        register(&engine, "svc.explode", |_args: Args| async move {
            if Json::Null.is_null() {
                panic!("backend exploded");
            }
            Ok(Json::Null)
        });

        let outcome = run(&engine, "print('going')\nawait svc.explode()").await;
        assert_eq!(
            outcome.logs(),
            ["going", "[ERROR] Code execution failed: panic: backend exploded"]
        );
    }

    #[tokio::test]
    async fn values_without_json_form_render_as_repr() {
        let outcome = run(&engine(), "return {'n': 1, 't': (1, 2)}").await;
        assert_eq!(outcome.result(), Some(&json!({ "n": 1, "t": [1, 2] })));

        let outcome = run(&engine(), "return len").await;
        assert_eq!(outcome.result(), Some(&json!("<built-in function len>")));
    }

    #[tokio::test]
    async fn introspection_entries_are_bound() {
        let engine = engine();
        register(&engine, "math.add", |_args: Args| async move { Ok(Json::Null) });

        let code = r#"
            text = __get_tool_interface("math.add")
            return [isinstance(__interfaces, str), "math.add" in text, __get_tool_interface("nope")]
        "#;
        let outcome = run(&engine, code).await;
        assert_eq!(outcome.result(), Some(&json!([true, true, null])));
    }

    #[tokio::test]
    async fn capabilities_extend_prelude_modules() {
        let engine = engine();
        register(&engine, "json.parse", |args: Args| async move {
            Ok(json!({ "parsed": args.get("text").cloned() }))
        });
        let code = r#"
            parsed = await json.parse(text='{}')
            import json as j
            from json import parse as p
            again = await p(text='[]')
            return [json.dumps({'a': 1}), parsed, j.dumps([1]), again]
        "#;
        let outcome = run(&engine, code).await;
        assert_eq!(
            outcome.result(),
            Some(&json!([r#"{"a": 1}"#, { "parsed": "{}" }, "[1]", { "parsed": "[]" }]))
        );
        assert!(outcome.logs().is_empty());
    }

    #[tokio::test]
    async fn pathological_snippets_end_in_diagnostics() {
        let engine = engine();
        let nested = format!("return {}1{}", "(".repeat(1000), ")".repeat(1000));
        let outcome = run(&engine, &nested).await;
        assert_eq!(outcome.result(), None);
        assert!(outcome.logs()[0].contains("SyntaxError: too many nested parentheses"));

        let outcome = run(&engine, "def f(n):\n    return f(n + 1) + 1\nreturn f(0)").await;
        assert!(outcome.logs()[0].contains("RecursionError: maximum recursion depth exceeded"));

        let outcome = run(&engine, "return 'a' * 10000000000").await;
        assert!(outcome.logs()[0].contains("MemoryError"));
    }
}

//! Compile-then-execute entry points.

use std::sync::Arc;

use tracing::trace;

use crate::ast::Stmt;
use crate::error::{ExecResult, ParseResult};
use crate::host::{Bindings, OutputSink};
use crate::interpreter::Interpreter;
use crate::lexer::dedent;
use crate::parser::parse_program;
use crate::value::Value;

/// Resource bounds applied to every execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum snippet function call depth.
    pub recursion_limit: usize,
    /// Loop iterations between cooperative yields to the scheduler.
    pub yield_interval: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            recursion_limit: 64,
            yield_interval: 1024,
        }
    }
}

/// A parsed snippet, ready to execute any number of times.
#[derive(Debug, Clone)]
pub struct Program {
    body: Arc<Vec<Stmt>>,
}

impl Program {
    /// Number of top-level statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Returns `true` for a snippet with no statements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Parses snippets and runs them against host bindings.
///
/// The snippet is the body of an anonymous `async` routine: `await` and
/// `return` are valid at the top level, and the routine's completion value
/// is the execution result.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptEngine {
    limits: Limits,
}

impl ScriptEngine {
    /// Creates an engine enforcing `limits`.
    #[must_use]
    pub const fn new(limits: Limits) -> Self {
        Self { limits }
    }

    /// Limits applied to executions.
    #[must_use]
    pub const fn limits(&self) -> Limits {
        self.limits
    }

    /// Parses `source`, removing common leading indentation first.
    ///
    /// # Errors
    ///
    /// Returns a [`SyntaxError`](crate::SyntaxError) locating the first
    /// malformed construct.
    pub fn compile(&self, source: &str) -> ParseResult<Program> {
        let body = parse_program(&dedent(source))?;
        trace!(statements = body.len(), "snippet compiled");
        Ok(Program {
            body: Arc::new(body),
        })
    }

    /// Executes `program` with `bindings` as its globals, sending console
    /// output to `sink`.
    ///
    /// Resolves to `Ok(None)` when the routine finishes without returning a
    /// value. Dropping the future cancels the run at its next suspension
    /// point.
    ///
    /// # Errors
    ///
    /// Returns the [`Exception`](crate::Exception) the snippet raised and
    /// did not catch.
    pub async fn execute(
        &self,
        program: &Program,
        bindings: Bindings,
        sink: Arc<dyn OutputSink>,
    ) -> ExecResult<Option<Value>> {
        let mut interpreter = Interpreter::new(bindings, sink, self.limits);
        interpreter.run(&program.body).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::{Exception, ExceptionKind};
    use crate::host::{CallArgs, HostFunction, Namespace, NativeFn, Stream};
    use crate::json::{from_json, to_json};

    #[derive(Default)]
    struct Console {
        writes: Mutex<Vec<(Stream, String)>>,
    }

    impl Console {
        fn text(&self) -> String {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|(_, text)| text.as_str())
                .collect()
        }
    }

    impl OutputSink for Console {
        fn write(&self, stream: Stream, text: &str) {
            self.writes.lock().unwrap().push((stream, text.to_owned()));
        }
    }

    struct Echo;

    #[async_trait]
    impl HostFunction for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn call(&self, args: CallArgs) -> ExecResult<Value> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let mut entries = indexmap::IndexMap::new();
            for (key, value) in args.keywords {
                entries.insert(crate::value::Key::Str(key), value);
            }
            Ok(Value::dict(entries))
        }
    }

    async fn run_with(source: &str, bindings: Bindings) -> (ExecResult<Option<Value>>, String) {
        let engine = ScriptEngine::default();
        let program = engine.compile(source).expect("snippet should parse");
        let console = Arc::new(Console::default());
        let result = engine.execute(&program, bindings, console.clone()).await;
        (result, console.text())
    }

    async fn run(source: &str) -> (ExecResult<Option<Value>>, String) {
        run_with(source, Bindings::prelude()).await
    }

    async fn result_json(source: &str) -> serde_json::Value {
        let (result, _) = run(source).await;
        to_json(&result.expect("snippet should succeed").expect("snippet should return")).unwrap()
    }

    #[tokio::test]
    async fn returns_arithmetic_result() {
        assert_eq!(result_json("x = 5\ny = 10\nreturn x + y").await, json!(15));
        assert_eq!(result_json("return 7 // 2, -7 // 2, 7 % -3, 2 ** 10").await, json!([3, -4, -2, 1024]));
        assert_eq!(result_json("return 1 / 4").await, json!(0.25));
    }

    #[tokio::test]
    async fn missing_return_is_empty() {
        let (result, _) = run("x = 1").await;
        assert!(result.unwrap().is_none());
        let (result, _) = run("return").await;
        assert!(result.unwrap().is_none());
        let (result, _) = run("return None").await;
        assert!(matches!(result.unwrap(), Some(Value::None)));
    }

    #[tokio::test]
    async fn print_matches_python_formatting() {
        let (_, out) = run("print('First log')\nprint('Number:', 42)\nprint(1.0, None, [1, 'a'], sep='|', end='!')").await;
        assert_eq!(out, "First log\nNumber: 42\n1.0|None|[1, 'a']!");
    }

    #[tokio::test]
    async fn stderr_writes_reach_the_sink() {
        let engine = ScriptEngine::default();
        let program = engine
            .compile("import sys\nsys.stderr.write('bad\\n')\nprint('x', file=sys.stderr)")
            .unwrap();
        let console = Arc::new(Console::default());
        engine
            .execute(&program, Bindings::prelude(), console.clone())
            .await
            .unwrap();
        let writes = console.writes.lock().unwrap();
        assert!(writes.iter().all(|(stream, _)| *stream == Stream::Stderr));
        assert_eq!(writes.len(), 2);
    }

    #[tokio::test]
    async fn control_flow_and_functions() {
        let source = r"
            def fib(n):
                if n < 2:
                    return n
                return fib(n - 1) + fib(n - 2)

            total = 0
            for i in range(10):
                if i % 2:
                    continue
                if i > 6:
                    break
                total += i
            count = 0
            while True:
                count += 1
                if count == 3:
                    break
            return [fib(10), total, count]
        ";
        assert_eq!(result_json(source).await, json!([55, 12, 3]));
    }

    #[tokio::test]
    async fn closures_defaults_and_varargs() {
        let source = r"
            def make_counter(start=0):
                state = {'n': start}
                def bump(step=1):
                    state['n'] += step
                    return state['n']
                return bump

            counter = make_counter(10)
            counter()
            counter(5)

            def collect(first, *rest, **named):
                return [first, list(rest), named]

            return [counter(), collect(1, 2, 3, flag=True), (lambda a, b=2: a * b)(4)]
        ";
        assert_eq!(
            result_json(source).await,
            json!([17, [1, [2, 3], {"flag": true}], 8])
        );
    }

    #[tokio::test]
    async fn comprehensions_and_builtins() {
        let source = r"
            squares = [n * n for n in range(6) if n % 2 == 0]
            index = {word: len(word) for word in ['a', 'bb', 'ccc']}
            pairs = sorted([(2, 'b'), (1, 'z'), (2, 'a')], key=lambda p: p[0], reverse=True)
            names = list(map(lambda w: w.upper(), filter(None, ['x', '', 'y'])))
            return {
                'squares': squares,
                'index': index,
                'pairs': pairs,
                'names': names,
                'max': max([3, 9, 4]),
                'min': min(['bb', 'a'], key=len),
                'sum': sum(x for x in range(5)),
                'joined': ', '.join(str(n) for n in [1, 2]),
            }
        ";
        assert_eq!(
            result_json(source).await,
            json!({
                "squares": [0, 4, 16],
                "index": {"a": 1, "bb": 2, "ccc": 3},
                "pairs": [[2, "b"], [2, "a"], [1, "z"]],
                "names": ["X", "Y"],
                "max": 9,
                "min": "a",
                "sum": 10,
                "joined": "1, 2",
            })
        );
    }

    #[tokio::test]
    async fn exceptions_are_catchable_values() {
        let source = r"
            seen = []
            try:
                {}['missing']
            except (TypeError, LookupError) as exc:
                seen.append(str(exc))
            finally:
                seen.append('finally')
            try:
                raise ValueError('bad value')
            except ValueError as exc:
                seen.append(repr(exc))
            else:
                seen.append('unreachable')
            try:
                1 / 0
            except Exception as exc:
                seen.append(isinstance(exc, ArithmeticError))
            return seen
        ";
        assert_eq!(
            result_json(source).await,
            json!(["'missing'", "finally", "ValueError('bad value')", true])
        );
    }

    #[tokio::test]
    async fn uncaught_exception_carries_line() {
        let (result, out) = run("print('before')\nx = [1]\nx[5]").await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::IndexError);
        assert_eq!(err.line(), Some(3));
        assert_eq!(err.to_string(), "IndexError: list index out of range (line 3)");
        assert_eq!(out, "before\n");
    }

    #[tokio::test]
    async fn bare_raise_reraises_handled_exception() {
        let (result, _) = run("try:\n    int('x')\nexcept ValueError:\n    raise").await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::ValueError);
        assert_eq!(err.line(), Some(2));
    }

    #[tokio::test]
    async fn recursion_limit_raises() {
        let (result, _) = run("def f(n):\n    return f(n + 1)\nf(0)").await;
        assert_eq!(result.unwrap_err().kind(), ExceptionKind::RecursionError);
    }

    const COUNTDOWN: &str = "\
def f(n):
    if n == 0:
        return 0
    return f(n - 1) + 1
";

    async fn countdown(limits: Limits, depth: usize) -> ExecResult<Option<Value>> {
        let engine = ScriptEngine::new(limits);
        let program = engine
            .compile(&format!("{COUNTDOWN}return f({})", depth - 1))
            .unwrap();
        let console: Arc<dyn OutputSink> = Arc::new(Console::default());
        engine.execute(&program, Bindings::prelude(), console).await
    }

    #[tokio::test]
    async fn recursion_reaches_exactly_the_limit() {
        let limits = Limits::default();
        let depth = limits.recursion_limit;
        let value = countdown(limits, depth).await.unwrap().unwrap();
        assert_eq!(to_json(&value).unwrap(), json!(depth - 1));

        let err = countdown(limits, depth + 1).await.unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::RecursionError);
        assert_eq!(err.message(), "maximum recursion depth exceeded");
    }

    #[tokio::test]
    async fn deep_recursion_limits_do_not_exhaust_the_stack() {
        let limits = Limits {
            recursion_limit: 2000,
            ..Limits::default()
        };
        let value = countdown(limits, 2000).await.unwrap().unwrap();
        assert_eq!(to_json(&value).unwrap(), json!(1999));
        let err = countdown(limits, 2001).await.unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::RecursionError);
    }

    #[tokio::test]
    async fn oversized_values_raise_memory_error() {
        for source in [
            "return 'a' * 10000000000",
            "return [0] * 10000000000",
            "return list(range(10000000000))",
            "s = 'ab'\nwhile True:\n    s = s + s",
            "return 'x'.ljust(10000000000)",
            "return f'{1:>10000000000}'",
            "return f'{1.5:.10000000000f}'",
        ] {
            let (result, _) = run(source).await;
            let err = result.expect_err(source);
            assert_eq!(err.kind(), ExceptionKind::MemoryError, "{source}");
        }
        let (result, _) = run("try:\n    'a' * 10000000000\nexcept MemoryError:\n    return 'caught'").await;
        assert!(matches!(result.unwrap(), Some(Value::Str(s)) if s == "caught"));
    }

    #[tokio::test]
    async fn deeply_nested_values_stay_on_the_heap() {
        let source = "x = []\nfor _ in range(1000):\n    x = [x]\nreturn len(repr(x))";
        assert_eq!(result_json(source).await, json!(2002));

        let (result, _) = run("x = []\nfor _ in range(1000):\n    x = [x]\nreturn json.dumps(x)").await;
        assert_eq!(result.unwrap_err().kind(), ExceptionKind::RecursionError);

        let source = format!("return 1{}", " + 1".repeat(20_000));
        assert_eq!(result_json(&source).await, json!(20_001));
    }

    #[tokio::test]
    async fn parameter_errors_name_the_function() {
        let (result, _) = run("def f(a, b):\n    pass\nf(1)").await;
        assert_eq!(
            result.unwrap_err().message(),
            "f() missing 1 required positional argument: 'b'"
        );
        let (result, _) = run("def f(a):\n    pass\nf(1, 2)").await;
        assert_eq!(
            result.unwrap_err().message(),
            "f() takes 1 positional argument but 2 were given"
        );
    }

    #[tokio::test]
    async fn awaits_host_functions_and_coroutines() {
        let mut bindings = Bindings::prelude();
        let mut tools = Namespace::new("tools");
        tools.insert("echo", Value::Host(Arc::new(Echo)));
        bindings.insert("tools", Value::Namespace(Arc::new(tools)));
        let source = r"
            async def twice(value):
                first = await tools.echo(v=value)
                return [first['v'], value]

            single = await tools.echo(a=1, b='two')
            both = await asyncio.gather(tools.echo(n=1), twice(2), tools.echo(n=3))
            await asyncio.sleep(0)
            return {'single': single, 'both': both}
        ";
        let (result, _) = run_with(source, bindings).await;
        let value = result.unwrap().unwrap();
        assert_eq!(
            to_json(&value).unwrap(),
            json!({"single": {"a": 1, "b": "two"}, "both": [{"n": 1}, [2, 2], {"n": 3}]})
        );
    }

    #[tokio::test]
    async fn awaitables_are_single_use() {
        let mut bindings = Bindings::prelude();
        bindings.insert("echo", Value::Host(Arc::new(Echo)));
        let (result, _) = run_with("c = echo()\nawait c\nawait c", bindings).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::RuntimeError);
        let (result, _) = run("await 3").await;
        assert_eq!(
            result.unwrap_err().message(),
            "object int can't be used in 'await' expression"
        );
    }

    #[tokio::test]
    async fn missing_namespace_member_is_capability_not_found() {
        let mut bindings = Bindings::prelude();
        bindings.insert("tools", Value::Namespace(Arc::new(Namespace::new("tools"))));
        let source = r"
            try:
                await tools.nope()
            except CapabilityNotFound as exc:
                return {'error': True, 'message': str(exc)}
        ";
        let (result, _) = run_with(source, bindings).await;
        let value = to_json(&result.unwrap().unwrap()).unwrap();
        assert_eq!(value["error"], json!(true));
        assert!(value["message"].as_str().unwrap().contains("tools.nope"));
    }

    #[tokio::test]
    async fn native_functions_are_called_synchronously() {
        let mut bindings = Bindings::prelude();
        bindings.insert(
            "shout",
            NativeFn::value("shout", |args: CallArgs| {
                let text = args.positional.first().map(Value::to_str).unwrap_or_default();
                if text.is_empty() {
                    return Err(Exception::value_error("nothing to shout"));
                }
                Ok(Value::Str(text.to_uppercase()))
            }),
        );
        let (result, _) = run_with("return shout('hey')", bindings.clone()).await;
        assert_eq!(result.unwrap().unwrap().to_str(), "HEY");
        let (result, _) = run_with("shout('')", bindings).await;
        assert_eq!(result.unwrap_err().kind(), ExceptionKind::ValueError);
    }

    #[tokio::test]
    async fn strings_and_formatting() {
        let source = r#"
            name = "world"
            value = 3.14159
            items = "a, b ,c".split(",")
            return [
                f"Hello {name}!",
                f"{value:.2f}|{42:>5}|{name!r}",
                [s.strip() for s in items],
                "{} + {} = {total}".format(1, 2, total=3),
                json.dumps({"k": [1, 2.5, None]}),
                "%s has %d items" % ("cart", 3),
            ]
        "#;
        assert_eq!(
            result_json(source).await,
            json!([
                "Hello world!",
                "3.14|   42|'world'",
                ["a", "b", "c"],
                "1 + 2 = 3",
                "{\"k\": [1, 2.5, null]}",
                "cart has 3 items",
            ])
        );
    }

    #[tokio::test]
    async fn unpacking_and_subscripts() {
        let source = r"
            a, (b, c) = 1, [2, 3]
            data = {'rows': [[1, 2], [3, 4]]}
            data['rows'][1][0] = 30
            data['extra'] = data['rows'][::-1]
            del data['rows']
            letters = 'abcdef'
            return [a, b, c, data, letters[1:4], letters[-2:]]
        ";
        assert_eq!(
            result_json(source).await,
            json!([1, 2, 3, {"extra": [[30, 4], [1, 2]]}, "bcd", "ef"])
        );
        let (result, _) = run("a, b = [1, 2, 3]").await;
        assert_eq!(
            result.unwrap_err().message(),
            "too many values to unpack (expected 2)"
        );
    }

    #[tokio::test]
    async fn imports_bind_modules() {
        assert_eq!(
            result_json("import math as m\nfrom json import loads\nreturn [m.floor(2.7), loads('[1]')]").await,
            json!([2, [1]])
        );
        let (result, _) = run("import os").await;
        assert_eq!(result.unwrap_err().kind(), ExceptionKind::ImportError);
    }

    #[tokio::test]
    async fn unknown_name_is_name_error() {
        let (result, _) = run("return undefined_thing").await;
        assert_eq!(
            result.unwrap_err().message(),
            "name 'undefined_thing' is not defined"
        );
    }

    #[tokio::test]
    async fn busy_loop_is_cancellable() {
        let engine = ScriptEngine::new(Limits {
            recursion_limit: 64,
            yield_interval: 16,
        });
        let program = engine.compile("while True:\n    pass").unwrap();
        let console: Arc<dyn OutputSink> = Arc::new(Console::default());
        let run = engine.execute(&program, Bindings::prelude(), console);
        let outcome = tokio::time::timeout(Duration::from_millis(50), run).await;
        assert!(outcome.is_err());
    }

    #[test]
    fn compile_reports_syntax_errors() {
        let engine = ScriptEngine::default();
        let err = engine.compile("def broken(:\n    pass").unwrap_err();
        assert_eq!(err.line(), 1);
        assert!(engine.compile("    x = 1\n    return x").is_ok());
        assert_eq!(engine.compile("a = 1\nb = 2").unwrap().len(), 2);
    }

    #[test]
    fn json_values_survive_a_run_boundary() {
        let value = from_json(&json!({"nested": {"list": [1, "two"]}}));
        assert_eq!(to_json(&value).unwrap(), json!({"nested": {"list": [1, "two"]}}));
    }
}

//! Embedded scripting engine for code-mode snippets.
//!
//! Snippets are written in an indentation-structured, Python-flavoured
//! language and run as the body of an anonymous `async` routine. Host code
//! reaches into a run only through [`Bindings`], [`HostFunction`],
//! [`NativeFunction`] and [`OutputSink`].

#![warn(missing_docs, clippy::pedantic)]

mod ast;
mod builtins;
mod engine;
mod error;
mod format;
mod host;
mod interpreter;
mod json;
mod lexer;
mod ops;
mod parser;
mod stack;
mod value;

pub use builtins::{Builtin, Module};
pub use engine::{Limits, Program, ScriptEngine};
pub use error::{Exception, ExceptionKind, ExecResult, ParseResult, SyntaxError};
pub use host::{Bindings, CallArgs, HostFunction, Namespace, NativeFn, NativeFunction, OutputSink, Stream};
/// Conversions between snippet values and `serde_json` values.
pub use json::{from_json, to_json, to_json_lossy};
pub use value::{Awaitable, BoundMethod, Function, Key, Range, Value};

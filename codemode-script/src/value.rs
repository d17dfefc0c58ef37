//! Runtime values and their Python-style rendering.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;

use crate::ast::FunctionDef;
use crate::builtins::{Builtin, Module};
use crate::error::{Exception, ExceptionKind, ExecResult};
use crate::format::float_repr;
use crate::host::{CallArgs, HostFunction, Namespace, NativeFunction, Stream};
use crate::interpreter::Scope;
use crate::stack::guarded;

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared, mutable list storage.
pub type ListRef = Arc<Mutex<Vec<Value>>>;

/// Shared, mutable, insertion-ordered dict storage.
pub type DictRef = Arc<Mutex<IndexMap<Key, Value>>>;

/// A value inside a snippet.
#[derive(Clone, Default)]
pub enum Value {
    /// `None`.
    #[default]
    None,
    /// `True` / `False`.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// Text.
    Str(String),
    /// Mutable list shared by reference.
    List(ListRef),
    /// Immutable tuple.
    Tuple(Arc<[Value]>),
    /// Mutable dict shared by reference.
    Dict(DictRef),
    /// Lazy integer range.
    Range(Range),
    /// Function defined by the snippet.
    Function(Arc<Function>),
    /// Function or type provided by the engine.
    Builtin(Builtin),
    /// Method bound to its receiver.
    Method(Arc<BoundMethod>),
    /// Asynchronous host callable.
    Host(Arc<dyn HostFunction>),
    /// Synchronous host callable.
    Native(Arc<dyn NativeFunction>),
    /// Host-provided namespace container.
    Namespace(Arc<Namespace>),
    /// Built-in module.
    Module(Module),
    /// Console stream object.
    Stream(Stream),
    /// Exception class.
    ExceptionType(ExceptionKind),
    /// Exception instance.
    Exception(Arc<Exception>),
    /// Pending asynchronous computation.
    Awaitable(Awaitable),
}

impl Value {
    /// Builds a string value.
    #[must_use]
    pub fn str(text: impl Into<String>) -> Self {
        Self::Str(text.into())
    }

    /// Builds a list value.
    #[must_use]
    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Arc::new(Mutex::new(items)))
    }

    /// Builds a tuple value.
    #[must_use]
    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(items.into())
    }

    /// Builds a dict value.
    #[must_use]
    pub fn dict(entries: IndexMap<Key, Self>) -> Self {
        Self::Dict(Arc::new(Mutex::new(entries)))
    }

    /// Python type name, as used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Range(_) => "range",
            Self::Function(_) => "function",
            Self::Builtin(builtin) if builtin.is_type() => "type",
            Self::Builtin(_) | Self::Native(_) => "builtin_function_or_method",
            Self::Method(_) => "method",
            Self::Host(_) => "capability",
            Self::Namespace(_) => "namespace",
            Self::Module(_) => "module",
            Self::Stream(_) => "TextIOWrapper",
            Self::ExceptionType(_) => "type",
            Self::Exception(exc) => exc.kind().name(),
            Self::Awaitable(_) => "coroutine",
        }
    }

    /// Python truthiness.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(items) => !lock(items).is_empty(),
            Self::Tuple(items) => !items.is_empty(),
            Self::Dict(entries) => !lock(entries).is_empty(),
            Self::Range(range) => range.len() > 0,
            Self::Namespace(ns) => !ns.is_empty(),
            _ => true,
        }
    }

    /// Returns `true` for values that can be called.
    #[must_use]
    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Self::Function(_)
                | Self::Builtin(_)
                | Self::Method(_)
                | Self::Host(_)
                | Self::Native(_)
                | Self::ExceptionType(_)
        )
    }

    /// Integer view of ints and bools.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Float view of numeric values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Text view of strings.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Python `repr()`.
    #[must_use]
    pub fn repr(&self) -> String {
        let mut out = String::new();
        write_repr(self, &mut out, &mut Vec::new());
        out
    }

    /// Python `str()`.
    #[must_use]
    pub fn to_str(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Exception(exc) => exc.message().to_owned(),
            other => other.repr(),
        }
    }

    /// Identity comparison used by `is`.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => Arc::ptr_eq(a, b),
            (Self::Dict(a), Self::Dict(b)) => Arc::ptr_eq(a, b),
            (Self::Tuple(a), Self::Tuple(b)) => Arc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::Module(a), Self::Module(b)) => a == b,
            (Self::Stream(a), Self::Stream(b)) => a == b,
            (Self::ExceptionType(a), Self::ExceptionType(b)) => a == b,
            (Self::Exception(a), Self::Exception(b)) => Arc::ptr_eq(a, b),
            (Self::Namespace(a), Self::Namespace(b)) => Arc::ptr_eq(a, b),
            (Self::Host(a), Self::Host(b)) => Arc::ptr_eq(a, b),
            (Self::Native(a), Self::Native(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Clones the elements of a list or tuple.
    pub(crate) fn sequence_items(&self) -> Option<Vec<Self>> {
        match self {
            Self::List(items) => Some(lock(items).clone()),
            Self::Tuple(items) => Some(items.to_vec()),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Exception> for Value {
    fn from(value: Exception) -> Self {
        Self::Exception(Arc::new(value))
    }
}

/// Hashable dict key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// `None`.
    None,
    /// Boolean key.
    Bool(bool),
    /// Integer key.
    Int(i64),
    /// Float key, stored by bit pattern.
    Float(u64),
    /// String key.
    Str(String),
    /// Tuple of hashable values.
    Tuple(Vec<Key>),
}

impl Key {
    /// Converts a snippet value to a key.
    ///
    /// # Errors
    ///
    /// Returns `TypeError` for unhashable values such as lists and dicts.
    pub fn from_value(value: &Value) -> ExecResult<Self> {
        Ok(match value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::Int(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
                #[allow(clippy::cast_possible_truncation)]
                Self::Int(*f as i64)
            }
            Value::Float(f) => Self::Float(f.to_bits()),
            Value::Str(s) => Self::Str(s.clone()),
            Value::Tuple(items) => Self::Tuple(
                items
                    .iter()
                    .map(Self::from_value)
                    .collect::<ExecResult<Vec<_>>>()?,
            ),
            other => {
                return Err(Exception::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )));
            }
        })
    }

    /// Converts the key back into a value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::None => Value::None,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int(*i),
            Self::Float(bits) => Value::Float(f64::from_bits(*bits)),
            Self::Str(s) => Value::Str(s.clone()),
            Self::Tuple(items) => Value::tuple(items.iter().map(Self::to_value).collect()),
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// `range(start, stop, step)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub(crate) start: i64,
    pub(crate) stop: i64,
    pub(crate) step: i64,
}

impl Range {
    pub(crate) fn new(start: i64, stop: i64, step: i64) -> ExecResult<Self> {
        if step == 0 {
            return Err(Exception::value_error("range() arg 3 must not be zero"));
        }
        Ok(Self { start, stop, step })
    }

    pub(crate) fn len(self) -> usize {
        let (start, stop, step) = (
            i128::from(self.start),
            i128::from(self.stop),
            i128::from(self.step),
        );
        let count = if step > 0 && start < stop {
            (stop - start + step - 1) / step
        } else if step < 0 && start > stop {
            (start - stop - step - 1) / -step
        } else {
            0
        };
        usize::try_from(count).unwrap_or(usize::MAX)
    }

    pub(crate) fn get(self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let offset = i64::try_from(index).ok()?.checked_mul(self.step)?;
        self.start.checked_add(offset)
    }

    pub(crate) fn contains(self, value: i64) -> bool {
        let in_bounds = if self.step > 0 {
            self.start <= value && value < self.stop
        } else {
            self.stop < value && value <= self.start
        };
        in_bounds && (i128::from(value) - i128::from(self.start)) % i128::from(self.step) == 0
    }

    pub(crate) fn iter(self) -> impl Iterator<Item = i64> {
        (0..self.len()).map_while(move |i| self.get(i))
    }
}

/// A function defined by `def`, `async def` or `lambda`.
pub struct Function {
    pub(crate) def: Arc<FunctionDef>,
    pub(crate) defaults: Vec<Option<Value>>,
    pub(crate) closure: Arc<Scope>,
}

impl Function {
    /// Declared name (`<lambda>` for lambdas).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }
}

/// A method looked up on a value but not yet called.
pub struct BoundMethod {
    pub(crate) receiver: Value,
    pub(crate) name: String,
}

/// Work that runs when awaited.
pub(crate) enum Pending {
    Host {
        function: Arc<dyn HostFunction>,
        args: CallArgs,
    },
    Coroutine {
        function: Arc<Function>,
        args: CallArgs,
    },
    Sleep(Duration),
    Gather(Vec<Value>),
}

/// One-shot awaitable produced by calling an async callable.
#[derive(Clone)]
pub struct Awaitable {
    label: Arc<str>,
    pending: Arc<Mutex<Option<Pending>>>,
}

impl Awaitable {
    pub(crate) fn new(label: &str, pending: Pending) -> Self {
        Self {
            label: label.into(),
            pending: Arc::new(Mutex::new(Some(pending))),
        }
    }

    pub(crate) fn take(&self) -> ExecResult<Pending> {
        lock(&self.pending).take().ok_or_else(|| {
            Exception::runtime_error("cannot reuse already awaited coroutine")
        })
    }

    fn label(&self) -> &str {
        &self.label
    }
}

fn write_repr(value: &Value, out: &mut String, seen: &mut Vec<usize>) {
    match value {
        Value::None => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => out.push_str(&float_repr(*f)),
        Value::Str(s) => out.push_str(&quote(s)),
        Value::List(items) => {
            let id = Arc::as_ptr(items) as usize;
            if seen.contains(&id) {
                out.push_str("[...]");
                return;
            }
            let snapshot = lock(items).clone();
            seen.push(id);
            out.push('[');
            write_items(&snapshot, out, seen);
            out.push(']');
            seen.pop();
        }
        Value::Tuple(items) => {
            out.push('(');
            write_items(items, out, seen);
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        Value::Dict(entries) => {
            let id = Arc::as_ptr(entries) as usize;
            if seen.contains(&id) {
                out.push_str("{...}");
                return;
            }
            let snapshot: Vec<(Key, Value)> = lock(entries)
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            seen.push(id);
            out.push('{');
            for (i, (key, value)) in snapshot.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(&key.to_value(), out, seen);
                out.push_str(": ");
                guarded(|| write_repr(value, out, seen));
            }
            out.push('}');
            seen.pop();
        }
        Value::Range(range) => {
            if range.step == 1 {
                out.push_str(&format!("range({}, {})", range.start, range.stop));
            } else {
                out.push_str(&format!(
                    "range({}, {}, {})",
                    range.start, range.stop, range.step
                ));
            }
        }
        Value::Function(function) => out.push_str(&format!("<function {}>", function.name())),
        Value::Builtin(builtin) if builtin.is_type() => {
            out.push_str(&format!("<class '{}'>", builtin.name()));
        }
        Value::Builtin(builtin) => {
            out.push_str(&format!("<built-in function {}>", builtin.name()));
        }
        Value::Native(function) => {
            out.push_str(&format!("<built-in function {}>", function.name()));
        }
        Value::Method(method) => out.push_str(&format!(
            "<built-in method {} of {} object>",
            method.name,
            method.receiver.type_name()
        )),
        Value::Host(function) => out.push_str(&format!("<capability '{}'>", function.name())),
        Value::Namespace(ns) => out.push_str(&format!("<namespace '{}'>", ns.name())),
        Value::Module(module) => out.push_str(&format!("<module '{}'>", module.name())),
        Value::Stream(stream) => out.push_str(&format!(
            "<_io.TextIOWrapper name='{}' encoding='utf-8'>",
            stream.label()
        )),
        Value::ExceptionType(kind) => out.push_str(&format!("<class '{kind}'>")),
        Value::Exception(exc) => {
            if exc.message().is_empty() {
                out.push_str(&format!("{}()", exc.kind()));
            } else {
                out.push_str(&format!("{}({})", exc.kind(), quote(exc.message())));
            }
        }
        Value::Awaitable(awaitable) => {
            out.push_str(&format!("<coroutine object {}>", awaitable.label()));
        }
    }
}

fn write_items(items: &[Value], out: &mut String, seen: &mut Vec<usize>) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        guarded(|| write_repr(item, out, seen));
    }
}

/// Quotes text the way Python's `repr` does.
pub(crate) fn quote(text: &str) -> String {
    let delimiter = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(delimiter);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == delimiter => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(delimiter);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_like_python() {
        let mut entries = IndexMap::new();
        entries.insert(Key::from("k"), Value::list(vec![Value::Int(1), Value::Float(2.0)]));
        entries.insert(Key::Int(3), Value::tuple(vec![Value::None]));
        let dict = Value::dict(entries);

        assert_eq!(dict.repr(), "{'k': [1, 2.0], 3: (None,)}");
        assert_eq!(Value::str("it's").repr(), "\"it's\"");
        assert_eq!(Value::str("a\nb").repr(), "'a\\nb'");
        assert_eq!(Value::str("plain").to_str(), "plain");
        assert_eq!(Value::Bool(true).to_str(), "True");
    }

    #[test]
    fn self_referencing_list_renders_ellipsis() {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &list {
            lock(items).push(list.clone());
        }
        assert_eq!(list.repr(), "[1, [...]]");
    }

    #[test]
    fn truthiness_follows_python() {
        assert!(!Value::str("").is_truthy());
        assert!(!Value::list(Vec::new()).is_truthy());
        assert!(Value::Float(0.1).is_truthy());
        assert!(!Value::Range(Range::new(3, 3, 1).unwrap()).is_truthy());
    }

    #[test]
    fn range_length_and_membership() {
        let range = Range::new(10, 0, -3).unwrap();
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![10, 7, 4, 1]);
        assert_eq!(range.len(), 4);
        assert!(range.contains(7));
        assert!(!range.contains(6));
        assert!(Range::new(0, 1, 0).is_err());
    }

    #[test]
    fn unhashable_keys_are_rejected() {
        let err = Key::from_value(&Value::list(Vec::new())).unwrap_err();
        assert_eq!(err.message(), "unhashable type: 'list'");
        assert_eq!(Key::from_value(&Value::Float(2.0)).unwrap(), Key::Int(2));
    }
}

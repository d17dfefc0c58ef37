//! The seam through which host code reaches into a snippet run.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::builtins::{Builtin, Module};
use crate::error::{Exception, ExceptionKind, ExecResult};
use crate::value::Value;

/// Arguments passed to a host callable.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    /// Positional arguments in call order.
    pub positional: Vec<Value>,
    /// Keyword arguments in call order.
    pub keywords: IndexMap<String, Value>,
}

impl CallArgs {
    /// Creates an empty argument list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a purely positional argument list.
    #[must_use]
    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            keywords: IndexMap::new(),
        }
    }

    /// Returns `true` when no argument was passed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }

    /// Fails with `TypeError` when any keyword argument was passed to `function`.
    ///
    /// # Errors
    ///
    /// Returns a `TypeError` naming the first unexpected keyword.
    pub fn reject_keywords(&self, function: &str) -> ExecResult<()> {
        match self.keywords.keys().next() {
            Some(name) => Err(Exception::type_error(format!(
                "{function}() got an unexpected keyword argument '{name}'"
            ))),
            None => Ok(()),
        }
    }

    /// Fails with `TypeError` unless between `min` and `max` positional
    /// arguments were passed.
    ///
    /// # Errors
    ///
    /// Returns a `TypeError` describing the expected arity.
    pub fn expect_positional(&self, function: &str, min: usize, max: usize) -> ExecResult<()> {
        let given = self.positional.len();
        if (min..=max).contains(&given) {
            return Ok(());
        }
        let expected = if min == max {
            format!("exactly {min}")
        } else if given < min {
            format!("at least {min}")
        } else {
            format!("at most {max}")
        };
        let plural = if expected.ends_with('1') { "" } else { "s" };
        Err(Exception::type_error(format!(
            "{function}() takes {expected} argument{plural} ({given} given)"
        )))
    }

    /// Removes and returns a keyword argument.
    pub fn take_keyword(&mut self, name: &str) -> Option<Value> {
        self.keywords.shift_remove(name)
    }
}

/// Output channel a snippet can write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Regular console output (`print`, `sys.stdout`).
    Stdout,
    /// Diagnostic output (`sys.stderr`).
    Stderr,
}

impl Stream {
    pub(crate) const fn label(self) -> &'static str {
        match self {
            Self::Stdout => "<stdout>",
            Self::Stderr => "<stderr>",
        }
    }
}

/// Receives every piece of console text a snippet writes.
pub trait OutputSink: Send + Sync {
    /// Records one write, exactly as the snippet produced it.
    fn write(&self, stream: Stream, text: &str);
}

/// An asynchronous callable supplied by the host.
///
/// Calling it from a snippet yields an awaitable; the body runs when the
/// snippet awaits it, which is a suspension point.
#[async_trait]
pub trait HostFunction: Send + Sync {
    /// Name shown in `repr` and error messages.
    fn name(&self) -> &str;

    /// Runs the call.
    async fn call(&self, args: CallArgs) -> ExecResult<Value>;
}

/// A synchronous callable supplied by the host.
pub trait NativeFunction: Send + Sync {
    /// Name shown in `repr` and error messages.
    fn name(&self) -> &str;

    /// Runs the call.
    fn call(&self, args: CallArgs) -> ExecResult<Value>;
}

/// Adapts a closure into a [`NativeFunction`].
pub struct NativeFn<F> {
    name: String,
    function: F,
}

impl<F> NativeFn<F>
where
    F: Fn(CallArgs) -> ExecResult<Value> + Send + Sync + 'static,
{
    /// Wraps `function` under `name`.
    pub fn new(name: impl Into<String>, function: F) -> Self {
        Self {
            name: name.into(),
            function,
        }
    }

    /// Wraps `function` and returns it as a snippet value.
    pub fn value(name: impl Into<String>, function: F) -> Value {
        Value::Native(Arc::new(Self::new(name, function)))
    }
}

impl<F> NativeFunction for NativeFn<F>
where
    F: Fn(CallArgs) -> ExecResult<Value> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: CallArgs) -> ExecResult<Value> {
        (self.function)(args)
    }
}

/// Mapping-based container grouping related bindings under one name.
///
/// A namespace may extend a pre-bound [`Module`]: its own members are
/// looked up first, then the module's attributes.
#[derive(Clone, Default)]
pub struct Namespace {
    name: String,
    members: IndexMap<String, Value>,
    module: Option<Module>,
}

impl Namespace {
    /// Creates an empty namespace.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: IndexMap::new(),
            module: None,
        }
    }

    /// Falls back to `module` for names this namespace does not define.
    #[must_use]
    pub fn extending(mut self, module: Module) -> Self {
        self.module = Some(module);
        self
    }

    /// Module this namespace extends, if any.
    #[must_use]
    pub const fn module(&self) -> Option<Module> {
        self.module
    }

    /// Namespace identifier.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds or replaces a member.
    pub fn insert(&mut self, member: impl Into<String>, value: Value) {
        self.members.insert(member.into(), value);
    }

    /// Looks up a member.
    #[must_use]
    pub fn get(&self, member: &str) -> Option<&Value> {
        self.members.get(member)
    }

    /// Looks up a member, then the extended module's attribute.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityNotFound` naming `namespace.member`, or the
    /// module's `AttributeError` when the namespace extends a module.
    pub fn member(&self, member: &str) -> ExecResult<Value> {
        if let Some(value) = self.members.get(member) {
            return Ok(value.clone());
        }
        match self.module {
            Some(module) => module.attribute(member),
            None => Err(Exception::new(
                ExceptionKind::CapabilityNotFound,
                format!("'{}.{member}' is not a registered capability", self.name),
            )),
        }
    }

    /// Member names in insertion order.
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` when the namespace has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("members", &self.members.keys().collect::<Vec<_>>())
            .field("module", &self.module)
            .finish()
    }
}

/// Insertion-ordered global bindings visible to one execution.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: IndexMap<String, Value>,
}

impl Bindings {
    /// Creates an empty binding set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a binding set holding the base utilities: builtin functions,
    /// exception classes and the pre-bound modules.
    #[must_use]
    pub fn prelude() -> Self {
        let mut bindings = Self::new();
        for builtin in Builtin::PRELUDE {
            bindings.insert(builtin.name(), Value::Builtin(builtin));
        }
        for kind in ExceptionKind::ALL {
            bindings.insert(kind.name(), Value::ExceptionType(kind));
        }
        for module in Module::ALL {
            bindings.insert(module.name(), Value::Module(module));
        }
        bindings
    }

    /// Adds or replaces a binding.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Looks up a binding.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Returns `true` if `name` is bound.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Bound names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` when nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

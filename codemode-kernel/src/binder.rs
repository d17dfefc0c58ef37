//! Builds the nested callable structure snippets use to reach capabilities.

use std::sync::Arc;

use async_trait::async_trait;
use codemode_primitives::Capability;
use codemode_script::{
    Bindings, CallArgs, Exception, ExceptionKind, ExecResult, HostFunction, Namespace, Value,
    from_json, to_json,
};
use codemode_tools::{Args, CapabilityError, CapabilityRegistry, binding_path};
use indexmap::IndexMap;
use serde_json::Value as Json;
use tracing::{debug, warn};

/// Snippet-side callable that forwards to [`CapabilityRegistry::invoke`].
///
/// Every backend failure reaches the snippet as a
/// `CapabilityInvocationError` carrying the capability name.
pub struct CapabilityForwarder {
    name: String,
    registry: Arc<CapabilityRegistry>,
}

impl CapabilityForwarder {
    /// Creates a forwarder for the capability registered as `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
        }
    }

    fn arguments(&self, args: CallArgs) -> ExecResult<Args> {
        let CallArgs {
            positional,
            keywords,
        } = args;
        let payload = match (positional.as_slice(), keywords.is_empty()) {
            ([], _) => {
                return keywords
                    .iter()
                    .map(|(key, value)| json_argument(value).map(|json| (key.clone(), json)))
                    .collect();
            }
            ([mapping @ Value::Dict(_)], true) => json_argument(mapping)?,
            _ => Json::Null,
        };
        match payload {
            Json::Object(map) => Ok(map),
            _ => Err(Exception::type_error(format!(
                "{}() accepts keyword arguments or a single mapping",
                self.name
            ))),
        }
    }
}

fn json_argument(value: &Value) -> ExecResult<Json> {
    to_json(value).map_err(|err| Exception::type_error(err.message().to_owned()))
}

impl std::fmt::Debug for CapabilityForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityForwarder")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl HostFunction for CapabilityForwarder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: CallArgs) -> ExecResult<Value> {
        let args = self.arguments(args)?;
        debug!(capability = %self.name, args = args.len(), "invoking capability");
        match self.registry.invoke(&self.name, args).await {
            Ok(output) => Ok(from_json(&output)),
            Err(err) => {
                warn!(capability = %self.name, error = %err, "capability invocation failed");
                let detail = match err {
                    CapabilityError::Execution { reason } => reason,
                    other => other.to_string(),
                };
                Err(Exception::new(
                    ExceptionKind::CapabilityInvocationError,
                    format!("Error calling capability '{}': {detail}", self.name),
                ))
            }
        }
    }
}

#[derive(Debug)]
enum Entry {
    Namespace(Namespace),
    Callable(Value),
}

/// Groups callables under sanitized namespace identifiers.
///
/// A dotted name lands in the namespace named by its first segment, shared
/// by every capability with the same sanitized prefix. A plain name binds at
/// the top level. When a namespace and a top-level callable claim the same
/// identifier, the later one replaces the earlier.
#[derive(Debug, Default)]
pub struct NamespaceBinder {
    entries: IndexMap<String, Entry>,
}

impl NamespaceBinder {
    /// Creates an empty binder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds one forwarder per capability, in listing order.
    #[must_use]
    pub fn from_capabilities(registry: &Arc<CapabilityRegistry>, capabilities: &[Capability]) -> Self {
        let mut binder = Self::new();
        for capability in capabilities {
            let forwarder = CapabilityForwarder::new(capability.name(), Arc::clone(registry));
            binder.bind(capability.name(), Value::Host(Arc::new(forwarder)));
        }
        binder
    }

    /// Attaches `callable` at the path derived from the dotted `name`.
    pub fn bind(&mut self, name: &str, callable: Value) {
        match binding_path(name) {
            (Some(namespace), leaf) => {
                if let Some(Entry::Namespace(existing)) = self.entries.get_mut(&namespace) {
                    existing.insert(leaf, callable);
                    return;
                }
                let mut container = Namespace::new(namespace.clone());
                container.insert(leaf, callable);
                self.entries.insert(namespace, Entry::Namespace(container));
            }
            (None, leaf) => {
                self.entries.insert(leaf, Entry::Callable(callable));
            }
        }
    }

    /// Top-level identifiers in first-bound order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of top-level entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing was bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Moves every entry into `bindings`.
    ///
    /// A namespace named after a pre-bound module extends that module, so
    /// both its capabilities and the module's attributes stay reachable.
    /// Any other same-named binding is replaced.
    pub fn apply(self, bindings: &mut Bindings) {
        for (name, entry) in self.entries {
            let value = match (entry, bindings.get(&name)) {
                (Entry::Namespace(namespace), Some(Value::Module(module))) => {
                    Value::Namespace(Arc::new(namespace.extending(*module)))
                }
                (Entry::Namespace(namespace), _) => Value::Namespace(Arc::new(namespace)),
                (Entry::Callable(callable), _) => callable,
            };
            bindings.insert(name, value);
        }
    }
}

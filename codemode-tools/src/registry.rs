//! Runtime registry for capability descriptors and their backends.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use codemode_primitives::Capability;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Keyword arguments passed to a capability backend.
pub type Args = Map<String, Value>;

/// Result alias for capability operations.
pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Trait implemented by capability backends.
#[async_trait]
pub trait CapabilityFn: Send + Sync {
    /// Invokes the backend with the given arguments, returning JSON output.
    async fn invoke(&self, args: Args) -> CapabilityResult<Value>;
}

#[async_trait]
impl<F, Fut> CapabilityFn for F
where
    F: Send + Sync + Fn(Args) -> Fut,
    Fut: Future<Output = CapabilityResult<Value>> + Send,
{
    async fn invoke(&self, args: Args) -> CapabilityResult<Value> {
        (self)(args).await
    }
}

#[derive(Default)]
struct RegistryInner {
    capabilities: Vec<Capability>,
    bindings: HashMap<String, Arc<dyn CapabilityFn>>,
}

/// Registry owning the ordered capability list and the name to backend map.
///
/// Registering a name twice replaces the backend while the list keeps both
/// descriptors.
#[derive(Default)]
pub struct CapabilityRegistry {
    inner: RwLock<RegistryInner>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("capability registry poisoned");
        let names: Vec<_> = inner.capabilities.iter().map(Capability::name).collect();
        f.debug_struct("CapabilityRegistry")
            .field("registered", &names)
            .finish()
    }
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability and its backend.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn add_capability<T>(&self, capability: Capability, backend: T)
    where
        T: CapabilityFn + 'static,
    {
        self.add_shared(capability, Arc::new(backend));
    }

    /// Registers a capability with an already shared backend.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn add_shared(&self, capability: Capability, backend: Arc<dyn CapabilityFn>) {
        let mut inner = self.inner.write().expect("capability registry poisoned");
        let name = capability.name().to_owned();
        if inner.bindings.insert(name.clone(), backend).is_some() {
            debug!(capability = %name, "capability backend replaced");
        }
        inner.capabilities.push(capability);
    }

    /// Returns a snapshot of the registered descriptors in registration order.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn list(&self) -> Vec<Capability> {
        let inner = self.inner.read().expect("capability registry poisoned");
        inner.capabilities.clone()
    }

    /// Returns the backend bound to the supplied name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn CapabilityFn>> {
        let inner = self.inner.read().ok()?;
        inner.bindings.get(name).cloned()
    }

    /// Invokes a registered capability, returning the backend result unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::NotFound`] when no backend is bound to
    /// `name`, or propagates whatever error the backend produced.
    pub async fn invoke(&self, name: &str, args: Args) -> CapabilityResult<Value> {
        let backend = self.get(name).ok_or_else(|| CapabilityError::NotFound {
            name: name.to_owned(),
        })?;
        backend.invoke(args).await
    }

    /// Number of descriptors in the list, duplicates included.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("capability registry poisoned")
            .capabilities
            .len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every descriptor and backend.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("capability registry poisoned");
        inner.capabilities.clear();
        inner.bindings.clear();
    }
}

/// Errors produced by capability lookup and invocation.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Requested capability does not exist.
    #[error("capability `{name}` is not registered")]
    NotFound {
        /// Name of the missing capability.
        name: String,
    },

    /// Backend execution failed.
    #[error("capability execution failed: {reason}")]
    Execution {
        /// Human-readable error returned by the backend.
        reason: String,
    },
}

impl CapabilityError {
    /// Creates an execution error from the supplied reason.
    #[must_use]
    pub fn execution(reason: impl Into<String>) -> Self {
        Self::Execution {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn capability(name: &str) -> Capability {
        Capability::builder(name)
            .description("Echo incoming payload")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn register_and_invoke_capability() {
        let registry = CapabilityRegistry::new();
        registry.add_capability(capability("util.echo"), |args: Args| async move {
            Ok(Value::Object(args))
        });

        let mut args = Args::new();
        args.insert("message".into(), json!("hello"));
        let output = registry.invoke("util.echo", args).await.unwrap();
        assert_eq!(output, json!({ "message": "hello" }));
    }

    #[tokio::test]
    async fn unknown_capability_errors() {
        let registry = CapabilityRegistry::new();
        let err = registry
            .invoke("missing", Args::new())
            .await
            .expect_err("unknown capability should error");

        assert!(matches!(err, CapabilityError::NotFound { name } if name == "missing"));
    }

    #[tokio::test]
    async fn backend_errors_propagate() {
        let registry = CapabilityRegistry::new();
        registry.add_capability(capability("fail"), |_args: Args| async move {
            Err(CapabilityError::execution("backend down"))
        });

        let err = registry.invoke("fail", Args::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "capability execution failed: backend down");
    }

    #[tokio::test]
    async fn reregistration_replaces_backend_but_keeps_both_entries() {
        let registry = CapabilityRegistry::new();
        registry.add_capability(capability("svc.version"), |_args: Args| async move {
            Ok(json!(1))
        });
        registry.add_capability(capability("svc.version"), |_args: Args| async move {
            Ok(json!(2))
        });

        assert_eq!(registry.len(), 2);
        let output = registry.invoke("svc.version", Args::new()).await.unwrap();
        assert_eq!(output, json!(2));
    }

    #[test]
    fn list_is_a_snapshot() {
        let registry = CapabilityRegistry::new();
        registry.add_capability(capability("a"), |_args: Args| async move { Ok(Value::Null) });
        let snapshot = registry.list();

        registry.add_capability(capability("b"), |_args: Args| async move { Ok(Value::Null) });
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let registry = CapabilityRegistry::new();
        registry.add_capability(capability("a"), |_args: Args| async move { Ok(Value::Null) });
        registry.clear();

        assert!(registry.is_empty());
        assert!(registry.get("a").is_none());
    }
}

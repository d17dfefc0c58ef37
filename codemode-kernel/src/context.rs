//! Per-run binding set.

use std::sync::Arc;

use codemode_script::{Bindings, CallArgs, NativeFn, Value};
use codemode_tools::{CapabilityRegistry, InterfaceGenerator};
use indexmap::IndexMap;

use crate::binder::NamespaceBinder;

/// Global holding the interface text of every registered capability.
pub const INTERFACES_BINDING: &str = "__interfaces";

/// Global function mapping a capability name to its interface text.
pub const INTERFACE_LOOKUP_BINDING: &str = "__get_tool_interface";

/// Everything one snippet run can see: the prelude, the two introspection
/// entries and the capability namespaces.
///
/// Built from a snapshot of the registry, so registrations made while the run
/// is in flight are not visible to it.
#[derive(Debug)]
pub struct ExecutionContext {
    bindings: Bindings,
    capabilities: usize,
}

impl ExecutionContext {
    /// Snapshots `registry` and assembles a fresh binding set.
    #[must_use]
    pub fn build(registry: &Arc<CapabilityRegistry>, interfaces: &InterfaceGenerator) -> Self {
        let capabilities = registry.list();
        let mut bindings = Bindings::prelude();

        bindings.insert(
            INTERFACES_BINDING,
            Value::str(interfaces.describe_all(&capabilities)),
        );

        let lookup: IndexMap<String, String> = capabilities
            .iter()
            .map(|capability| (capability.name().to_owned(), interfaces.describe(capability)))
            .collect();
        bindings.insert(
            INTERFACE_LOOKUP_BINDING,
            NativeFn::value(INTERFACE_LOOKUP_BINDING, move |args: CallArgs| {
                args.reject_keywords(INTERFACE_LOOKUP_BINDING)?;
                args.expect_positional(INTERFACE_LOOKUP_BINDING, 1, 1)?;
                let text = args
                    .positional
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|name| lookup.get(name));
                Ok(text.map_or(Value::None, |text| Value::str(text.clone())))
            }),
        );

        NamespaceBinder::from_capabilities(registry, &capabilities).apply(&mut bindings);

        Self {
            bindings,
            capabilities: capabilities.len(),
        }
    }

    /// Bindings visible to the run.
    #[must_use]
    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Number of capability descriptors in the snapshot.
    #[must_use]
    pub const fn capability_count(&self) -> usize {
        self.capabilities
    }

    /// Consumes the context, yielding its bindings.
    #[must_use]
    pub fn into_bindings(self) -> Bindings {
        self.bindings
    }
}

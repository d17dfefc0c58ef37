//! Capability descriptors shared across the code-mode runtime.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Describes one callable capability (tool) exposed to snippets.
///
/// The dotted `name` is the external identity: the segment before the first
/// `.` is the namespace, the remaining segments form the leaf name. A name
/// without a `.` binds at the top level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "empty_object", rename = "inputs")]
    input_schema: Value,
    #[serde(default = "empty_object", rename = "outputs")]
    output_schema: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(default, rename = "tool_call_template")]
    invocation_template: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Capability {
    /// Starts building a capability descriptor.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> CapabilityBuilder {
        CapabilityBuilder {
            name: name.into(),
            description: String::new(),
            input_schema: empty_object(),
            output_schema: empty_object(),
            tags: Vec::new(),
            invocation_template: Value::Null,
        }
    }

    /// Returns the dotted capability name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the human-readable description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// JSON-Schema-like description of the accepted arguments.
    #[must_use]
    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// JSON-Schema-like description of the returned mapping.
    #[must_use]
    pub fn output_schema(&self) -> &Value {
        &self.output_schema
    }

    /// Tags in declaration order, without duplicates.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Opaque transport descriptor; the runtime never interprets it.
    #[must_use]
    pub fn invocation_template(&self) -> &Value {
        &self.invocation_template
    }

    /// Returns the namespace segment when the name is dotted.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.name.split_once('.').map(|(namespace, _)| namespace)
    }

    /// Replaces the description in place.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }
}

/// Builder for [`Capability`].
pub struct CapabilityBuilder {
    name: String,
    description: String,
    input_schema: Value,
    output_schema: Value,
    tags: Vec<String>,
    invocation_template: Value,
}

impl CapabilityBuilder {
    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the input schema. No well-formedness checks are applied.
    #[must_use]
    pub fn inputs(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Sets the output schema. No well-formedness checks are applied.
    #[must_use]
    pub fn outputs(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    /// Adds a tag; repeated tags are kept once.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    /// Adds every tag from the iterator.
    #[must_use]
    pub fn tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        tags.into_iter().fold(self, Self::tag)
    }

    /// Sets the opaque invocation template.
    #[must_use]
    pub fn invocation_template(mut self, template: Value) -> Self {
        self.invocation_template = template;
        self
    }

    /// Finalises the capability descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if the name is blank.
    pub fn build(self) -> Result<Capability> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidCapability {
                reason: "name cannot be empty".into(),
            });
        }

        Ok(Capability {
            name: self.name,
            description: self.description,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            tags: self.tags,
            invocation_template: self.invocation_template,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_capability_success() {
        let capability = Capability::builder("math.add")
            .description("Adds two numbers")
            .inputs(json!({ "type": "object" }))
            .tags(["math", "arithmetic", "math"])
            .build()
            .expect("build");

        assert_eq!(capability.name(), "math.add");
        assert_eq!(capability.namespace(), Some("math"));
        assert_eq!(capability.tags(), ["math", "arithmetic"]);
        assert_eq!(capability.output_schema(), &json!({}));
    }

    #[test]
    fn capability_requires_name() {
        let err = Capability::builder("  ").build().expect_err("should fail");
        assert!(matches!(err, Error::InvalidCapability { .. }));
    }

    #[test]
    fn deserializes_manual_entry() {
        let capability: Capability = serde_json::from_value(json!({
            "name": "search",
            "description": "Search the index",
            "inputs": { "type": "object", "properties": { "q": { "type": "string" } } },
            "tags": ["lookup"],
            "tool_call_template": { "call_template_type": "http" }
        }))
        .expect("decode");

        assert_eq!(capability.namespace(), None);
        assert_eq!(capability.invocation_template()["call_template_type"], "http");
        assert_eq!(capability.output_schema(), &json!({}));
    }
}

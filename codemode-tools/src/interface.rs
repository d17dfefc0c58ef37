//! Human-readable interface text generated from capability schemas.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::RwLock;

use codemode_primitives::Capability;
use serde_json::Value;

/// First line of the text produced by [`InterfaceGenerator::describe_all`].
pub const INTERFACES_HEADER: &str = "# Auto-generated interfaces for registered capabilities";

/// Replaces every character outside `[A-Za-z0-9_]` with `_` and prefixes a
/// leading digit with `_`. An empty input yields `_`.
#[must_use]
pub fn sanitize_identifier(text: &str) -> String {
    let mut sanitized: String = text
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if sanitized.is_empty() || sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

/// Splits a capability name into its sanitized `(namespace, leaf)` pair.
///
/// For dotted names every segment after the first is sanitized on its own
/// and the results are joined with `_`.
#[must_use]
pub fn binding_path(name: &str) -> (Option<String>, String) {
    match name.split_once('.') {
        Some((namespace, rest)) => {
            let leaf = rest
                .split('.')
                .map(sanitize_identifier)
                .collect::<Vec<_>>()
                .join("_");
            (Some(sanitize_identifier(namespace)), leaf)
        }
        None => (None, sanitize_identifier(name)),
    }
}

/// Renders capability interfaces and caches them by capability name.
///
/// Entries are written once and never invalidated; re-registering a name
/// keeps serving the first rendering until [`InterfaceGenerator::clear`].
#[derive(Debug, Default)]
pub struct InterfaceGenerator {
    cache: RwLock<HashMap<String, String>>,
}

impl InterfaceGenerator {
    /// Creates a generator with an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the interface text for one capability.
    ///
    /// # Panics
    ///
    /// Panics if the internal cache lock is poisoned.
    #[must_use]
    pub fn describe(&self, capability: &Capability) -> String {
        if let Some(cached) = self.cached(capability.name()) {
            return cached;
        }

        let rendered = render(capability);
        let mut cache = self.cache.write().expect("interface cache poisoned");
        cache
            .entry(capability.name().to_owned())
            .or_insert(rendered)
            .clone()
    }

    /// Returns the header followed by every capability's interface, in order,
    /// separated by blank lines.
    #[must_use]
    pub fn describe_all(&self, capabilities: &[Capability]) -> String {
        let blocks: Vec<String> = capabilities.iter().map(|c| self.describe(c)).collect();
        format!("{INTERFACES_HEADER}\n{}", blocks.join("\n\n"))
    }

    /// Returns the cached text for `name`, if any.
    #[must_use]
    pub fn cached(&self, name: &str) -> Option<String> {
        self.cache.read().ok()?.get(name).cloned()
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or_default()
    }

    /// Returns `true` when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cached entry.
    ///
    /// # Panics
    ///
    /// Panics if the internal cache lock is poisoned.
    pub fn clear(&self) {
        self.cache.write().expect("interface cache poisoned").clear();
    }
}

fn render(capability: &Capability) -> String {
    let (namespace, leaf) = binding_path(capability.name());
    let mut out = String::new();
    let (indent, access) = match &namespace {
        Some(namespace) => {
            let _ = writeln!(out, "namespace {namespace}:");
            ("    ", format!("{namespace}.{leaf}"))
        }
        None => ("", leaf.clone()),
    };
    let doc = format!("{indent}    ");

    let _ = writeln!(out, "{indent}async def {leaf}(**kwargs) -> mapping:");
    let _ = writeln!(out, "{doc}\"\"\"");
    let _ = writeln!(out, "{doc}{}", capability.description());
    out.push('\n');
    let _ = writeln!(out, "{}", schema_section(capability.input_schema(), "Args", &doc));
    out.push('\n');
    let _ = writeln!(out, "{}", schema_section(capability.output_schema(), "Returns", &doc));
    out.push('\n');
    let _ = writeln!(out, "{}", format!("{doc}Tags: {}", capability.tags().join(", ")).trim_end());
    let _ = writeln!(out, "{doc}\"\"\"");
    out.push('\n');
    let _ = write!(out, "# Access as: {access}(**kwargs)");
    out
}

fn schema_section(schema: &Value, section: &str, indent: &str) -> String {
    let entry_indent = format!("{indent}    ");
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return format!("{indent}{section}:\n{entry_indent}any");
    }

    let properties = match schema.get("properties").and_then(Value::as_object) {
        Some(properties) if !properties.is_empty() => properties,
        _ => return format!("{indent}{section}:\n{entry_indent}mapping: any mapping"),
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut lines = vec![format!("{indent}{section}:")];
    for (name, property) in properties {
        let marker = if required.contains(&name.as_str()) {
            ""
        } else {
            " (optional)"
        };
        let description = property
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        lines.push(
            format!(
                "{entry_indent}{name} ({}){marker}: {description}",
                type_name(property)
            )
            .trim_end()
            .to_owned(),
        );
    }
    lines.join("\n")
}

fn type_name(schema: &Value) -> String {
    let has_enum = schema
        .get("enum")
        .and_then(Value::as_array)
        .is_some_and(|values| !values.is_empty());
    if has_enum {
        return "text".into();
    }

    match schema.get("type") {
        Some(Value::String(name)) => primitive_name(name).into(),
        Some(Value::Array(names)) => names
            .iter()
            .map(|name| name.as_str().map_or("any", primitive_name))
            .collect::<Vec<_>>()
            .join(" | "),
        _ => "any".into(),
    }
}

fn primitive_name(json_type: &str) -> &'static str {
    match json_type {
        "string" => "text",
        "number" => "decimal",
        "integer" => "integer",
        "boolean" => "boolean",
        "array" => "sequence",
        "object" => "mapping",
        "null" => "empty",
        _ => "any",
    }
}

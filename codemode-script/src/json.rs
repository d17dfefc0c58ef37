//! Conversions between snippet values and JSON.

use serde_json::{Map, Number, Value as Json};

use std::sync::Arc;

use crate::error::{Exception, ExceptionKind, ExecResult};
use crate::format::float_repr;
use crate::stack::guarded;
use crate::value::{Key, Value, lock};

/// Converts JSON into a snippet value.
#[must_use]
pub fn from_json(json: &Json) -> Value {
    match json {
        Json::Null => Value::None,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::None),
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => Value::list(items.iter().map(from_json).collect()),
        Json::Object(entries) => Value::dict(
            entries
                .iter()
                .map(|(k, v)| (Key::Str(k.clone()), from_json(v)))
                .collect(),
        ),
    }
}

/// Containers nested deeper than this cannot be converted to JSON.
pub(crate) const MAX_JSON_DEPTH: usize = 512;

fn too_deep() -> Exception {
    Exception::new(
        ExceptionKind::RecursionError,
        "maximum recursion depth exceeded while encoding a JSON object",
    )
}

fn circular() -> Exception {
    Exception::value_error("Circular reference detected")
}

/// Converts a snippet value into JSON.
///
/// # Errors
///
/// Returns `TypeError` for values with no JSON form (functions, modules,
/// tuple keys), `ValueError` for non-finite floats and self-containing
/// containers, and `RecursionError` past [`MAX_JSON_DEPTH`] levels.
pub fn to_json(value: &Value) -> ExecResult<Json> {
    convert(value, false, &mut Vec::new())
}

/// Converts a snippet value into JSON, rendering anything without a JSON
/// form as its `repr` text.
#[must_use]
pub fn to_json_lossy(value: &Value) -> Json {
    convert(value, true, &mut Vec::new()).unwrap_or_else(|_| Json::String(value.repr()))
}

fn enter(id: usize, seen: &mut Vec<usize>) -> ExecResult<()> {
    if seen.contains(&id) {
        return Err(circular());
    }
    if seen.len() >= MAX_JSON_DEPTH {
        return Err(too_deep());
    }
    seen.push(id);
    Ok(())
}

fn convert(value: &Value, lossy: bool, seen: &mut Vec<usize>) -> ExecResult<Json> {
    Ok(match value {
        Value::None => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number((*i).into()),
        Value::Float(f) => match Number::from_f64(*f) {
            Some(n) => Json::Number(n),
            None if lossy => Json::String(float_repr(*f)),
            None => {
                return Err(Exception::value_error(
                    "Out of range float values are not JSON compliant",
                ));
            }
        },
        Value::Str(s) => Json::String(s.clone()),
        Value::List(_) | Value::Tuple(_) => {
            let items = value.sequence_items().unwrap_or_default();
            enter(container_id(value), seen)?;
            let array = guarded(|| {
                items
                    .iter()
                    .map(|item| convert(item, lossy, seen))
                    .collect::<ExecResult<Vec<_>>>()
            })?;
            seen.pop();
            Json::Array(array)
        }
        Value::Dict(entries) => {
            let snapshot: Vec<(Key, Value)> = lock(entries)
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            enter(container_id(value), seen)?;
            let mut object = Map::new();
            for (key, item) in snapshot {
                let name = match key_text(&key) {
                    Ok(name) => name,
                    Err(_) if lossy => key.to_value().repr(),
                    Err(err) => return Err(err),
                };
                object.insert(name, guarded(|| convert(&item, lossy, seen))?);
            }
            seen.pop();
            Json::Object(object)
        }
        other if lossy => Json::String(other.repr()),
        other => {
            return Err(Exception::type_error(format!(
                "Object of type {} is not JSON serializable",
                other.type_name()
            )));
        }
    })
}

/// Identity of a container for cycle detection. Tuples are immutable and
/// cannot contain themselves, so each gets a distinct address-derived id.
fn container_id(value: &Value) -> usize {
    match value {
        Value::List(items) => Arc::as_ptr(items) as usize,
        Value::Dict(entries) => Arc::as_ptr(entries) as usize,
        Value::Tuple(items) => Arc::as_ptr(items).cast::<()>() as usize,
        _ => 0,
    }
}

fn key_text(key: &Key) -> ExecResult<String> {
    match key {
        Key::Str(s) => Ok(s.clone()),
        Key::Int(i) => Ok(i.to_string()),
        Key::Float(bits) => Ok(float_repr(f64::from_bits(*bits))),
        Key::Bool(true) => Ok("true".into()),
        Key::Bool(false) => Ok("false".into()),
        Key::None => Ok("null".into()),
        Key::Tuple(_) => Err(Exception::type_error(
            "keys must be str, int, float, bool or None, not tuple",
        )),
    }
}

/// Options accepted by `json.dumps`.
#[derive(Debug, Clone, Default)]
pub(crate) struct DumpOptions {
    pub indent: Option<String>,
    pub sort_keys: bool,
    pub ensure_ascii: bool,
}

/// `json.dumps` with Python's default separators and escaping.
pub(crate) fn dumps(value: &Value, options: &DumpOptions) -> ExecResult<String> {
    let mut out = String::new();
    write_value(value, options, 0, &mut out, &mut Vec::new())?;
    Ok(out)
}

fn write_value(
    value: &Value,
    options: &DumpOptions,
    level: usize,
    out: &mut String,
    seen: &mut Vec<usize>,
) -> ExecResult<()> {
    if level >= MAX_JSON_DEPTH {
        return Err(too_deep());
    }
    match value {
        Value::None => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) if f.is_nan() => out.push_str("NaN"),
        Value::Float(f) if f.is_infinite() => {
            out.push_str(if *f > 0.0 { "Infinity" } else { "-Infinity" });
        }
        Value::Float(f) => out.push_str(&float_repr(*f)),
        Value::Str(s) => write_string(s, options.ensure_ascii, out),
        Value::List(items) => {
            let id = Arc::as_ptr(items) as usize;
            if seen.contains(&id) {
                return Err(circular());
            }
            seen.push(id);
            let snapshot = lock(items).clone();
            write_array(&snapshot, options, level, out, seen)?;
            seen.pop();
        }
        Value::Tuple(items) => write_array(items, options, level, out, seen)?,
        Value::Dict(entries) => {
            let id = Arc::as_ptr(entries) as usize;
            if seen.contains(&id) {
                return Err(circular());
            }
            seen.push(id);
            let mut snapshot = Vec::new();
            for (key, item) in lock(entries).iter() {
                snapshot.push((key_text(key)?, item.clone()));
            }
            if options.sort_keys {
                snapshot.sort_by(|a, b| a.0.cmp(&b.0));
            }
            write_object(&snapshot, options, level, out, seen)?;
            seen.pop();
        }
        other => {
            return Err(Exception::type_error(format!(
                "Object of type {} is not JSON serializable",
                other.type_name()
            )));
        }
    }
    Ok(())
}

fn newline(options: &DumpOptions, level: usize, out: &mut String) {
    if let Some(indent) = &options.indent {
        out.push('\n');
        for _ in 0..level {
            out.push_str(indent);
        }
    }
}

fn item_separator(options: &DumpOptions) -> &'static str {
    if options.indent.is_some() { "," } else { ", " }
}

fn write_array(
    items: &[Value],
    options: &DumpOptions,
    level: usize,
    out: &mut String,
    seen: &mut Vec<usize>,
) -> ExecResult<()> {
    if items.is_empty() {
        out.push_str("[]");
        return Ok(());
    }
    out.push('[');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(item_separator(options));
        }
        newline(options, level + 1, out);
        guarded(|| write_value(item, options, level + 1, out, seen))?;
    }
    newline(options, level, out);
    out.push(']');
    Ok(())
}

fn write_object(
    entries: &[(String, Value)],
    options: &DumpOptions,
    level: usize,
    out: &mut String,
    seen: &mut Vec<usize>,
) -> ExecResult<()> {
    if entries.is_empty() {
        out.push_str("{}");
        return Ok(());
    }
    out.push('{');
    for (i, (key, item)) in entries.iter().enumerate() {
        if i > 0 {
            out.push_str(item_separator(options));
        }
        newline(options, level + 1, out);
        write_string(key, options.ensure_ascii, out);
        out.push_str(": ");
        guarded(|| write_value(item, options, level + 1, out, seen))?;
    }
    newline(options, level, out);
    out.push('}');
    Ok(())
}

fn write_string(text: &str, ensure_ascii: bool, out: &mut String) {
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c if ensure_ascii && !c.is_ascii() => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{unit:04x}"));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// `json.loads`.
pub(crate) fn loads(text: &str) -> ExecResult<Value> {
    serde_json::from_str::<Json>(text)
        .map(|json| from_json(&json))
        .map_err(|err| Exception::value_error(format!("invalid JSON: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_keeps_order() {
        let source = json!({"z": 1, "a": [true, null, 2.5], "m": {"k": "v"}});
        let value = from_json(&source);
        assert_eq!(value.repr(), "{'z': 1, 'a': [True, None, 2.5], 'm': {'k': 'v'}}");
        assert_eq!(to_json(&value).unwrap(), source);
    }

    #[test]
    fn dumps_uses_python_separators() {
        let value = from_json(&json!({"b": [1, 2], "a": "é"}));
        let compact = dumps(&value, &DumpOptions { ensure_ascii: true, ..DumpOptions::default() }).unwrap();
        assert_eq!(compact, r#"{"b": [1, 2], "a": "\u00e9"}"#);

        let pretty = dumps(
            &value,
            &DumpOptions {
                indent: Some("  ".into()),
                sort_keys: true,
                ensure_ascii: false,
            },
        )
        .unwrap();
        assert_eq!(pretty, "{\n  \"a\": \"é\",\n  \"b\": [\n    1,\n    2\n  ]\n}");
    }

    #[test]
    fn non_serialisable_values() {
        let value = Value::list(vec![Value::Builtin(crate::builtins::Builtin::Len)]);
        let err = to_json(&value).unwrap_err();
        assert!(err.message().contains("not JSON serializable"));
        assert_eq!(to_json_lossy(&value), json!(["<built-in function len>"]));
        assert_eq!(to_json_lossy(&Value::Float(f64::NAN)), json!("nan"));
    }

    #[test]
    fn loads_reports_value_error() {
        assert!(loads("{\"a\": 1}").is_ok());
        let err = loads("{not json").unwrap_err();
        assert_eq!(err.kind(), crate::error::ExceptionKind::ValueError);
    }

    #[test]
    fn self_containing_lists_are_rejected() {
        let list = Value::list(Vec::new());
        if let Value::List(items) = &list {
            lock(items).push(list.clone());
        }
        assert_eq!(to_json(&list).unwrap_err().message(), "Circular reference detected");
        assert_eq!(dumps(&list, &DumpOptions::default()).unwrap_err().kind(), ExceptionKind::ValueError);
        assert_eq!(to_json_lossy(&list), json!("[[...]]"));
    }

    #[test]
    fn shared_children_are_not_circular() {
        let child = Value::tuple(vec![Value::Int(1)]);
        let parent = Value::list(vec![child.clone(), child]);
        assert_eq!(to_json(&parent).unwrap(), json!([[1], [1]]));
    }

    #[test]
    fn deep_nesting_raises_recursion_error() {
        let mut value = Value::Int(0);
        for _ in 0..MAX_JSON_DEPTH + 1 {
            value = Value::list(vec![value]);
        }
        assert_eq!(to_json(&value).unwrap_err().kind(), ExceptionKind::RecursionError);
        let err = dumps(&value, &DumpOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::RecursionError);

        let mut value = Value::Int(0);
        for _ in 0..MAX_JSON_DEPTH - 1 {
            value = Value::list(vec![value]);
        }
        assert!(to_json(&value).is_ok());
    }
}

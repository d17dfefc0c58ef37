//! Operators, comparison, indexing and iteration over values.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::ast::BinOp;
use crate::error::{Exception, ExceptionKind, ExecResult};
use crate::format::percent_format;
use crate::stack::guarded;
use crate::value::{Key, Value, lock};

fn overflow() -> Exception {
    Exception::new(ExceptionKind::OverflowError, "integer overflow")
}

fn zero_division(message: &str) -> Exception {
    Exception::new(ExceptionKind::ZeroDivisionError, message)
}

fn unsupported(op: BinOp, left: &Value, right: &Value) -> Exception {
    Exception::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

/// Largest string (in bytes) or sequence (in items) a snippet may build.
pub(crate) const MAX_SEQUENCE_LEN: usize = 1 << 24;

/// Checks that a value of `len` units fits under [`MAX_SEQUENCE_LEN`].
pub(crate) fn ensure_size(len: usize) -> ExecResult<usize> {
    if len > MAX_SEQUENCE_LEN {
        return Err(Exception::new(
            ExceptionKind::MemoryError,
            format!("result of {len} items exceeds the limit of {MAX_SEQUENCE_LEN}"),
        ));
    }
    Ok(len)
}

/// Number of copies for `sequence * n`, rejecting results over the limit.
fn repeat_count(unit: usize, times: i64) -> ExecResult<usize> {
    let times = usize::try_from(times).unwrap_or(0);
    if unit == 0 || times == 0 {
        return Ok(0);
    }
    ensure_size(unit.checked_mul(times).unwrap_or(usize::MAX))?;
    Ok(times)
}

fn repeat<T: Clone>(items: &[T], times: i64) -> ExecResult<Vec<T>> {
    let times = repeat_count(items.len(), times)?;
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    Ok(out)
}

/// Evaluates `left op right`.
pub(crate) fn binary(op: BinOp, left: &Value, right: &Value) -> ExecResult<Value> {
    if let (Some(a), Some(b)) = (int_operand(left), int_operand(right)) {
        return int_binary(op, a, b);
    }
    if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
        return float_binary(op, a, b);
    }

    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            ensure_size(a.len().saturating_add(b.len()))?;
            Ok(Value::Str(format!("{a}{b}")))
        }
        (BinOp::Add, Value::Str(_), other) => Err(Exception::type_error(format!(
            "can only concatenate str (not \"{}\") to str",
            other.type_name()
        ))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = lock(a).clone();
            let extra = lock(b).clone();
            ensure_size(items.len().saturating_add(extra.len()))?;
            items.extend(extra);
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::List(_), other) => Err(Exception::type_error(format!(
            "can only concatenate list (not \"{}\") to list",
            other.type_name()
        ))),
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            ensure_size(a.len().saturating_add(b.len()))?;
            let mut items = a.to_vec();
            items.extend(b.iter().cloned());
            Ok(Value::tuple(items))
        }
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if n.as_int().is_some() => {
            let times = repeat_count(s.len(), n.as_int().unwrap_or(0))?;
            Ok(Value::Str(s.repeat(times)))
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items))
            if n.as_int().is_some() =>
        {
            let snapshot = lock(items).clone();
            Ok(Value::list(repeat(&snapshot, n.as_int().unwrap_or(0))?))
        }
        (BinOp::Mul, Value::Tuple(items), n) | (BinOp::Mul, n, Value::Tuple(items))
            if n.as_int().is_some() =>
        {
            Ok(Value::tuple(repeat(items, n.as_int().unwrap_or(0))?))
        }
        (BinOp::Mod, Value::Str(template), values) => {
            Ok(Value::Str(percent_format(template, values)?))
        }
        _ => Err(unsupported(op, left, right)),
    }
}

fn int_operand(value: &Value) -> Option<i64> {
    match value {
        Value::Int(_) | Value::Bool(_) => value.as_int(),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn int_binary(op: BinOp, a: i64, b: i64) -> ExecResult<Value> {
    let value = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinOp::Div => {
            if b == 0 {
                return Err(zero_division("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            if a == i64::MIN && b == -1 {
                return Err(overflow());
            }
            floor_div(a, b)
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            floor_mod(a, b)
        }
        BinOp::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(zero_division("0.0 cannot be raised to a negative power"));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            let exponent = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exponent).ok_or_else(overflow)?
        }
    };
    Ok(Value::Int(value))
}

fn floor_div(a: i64, b: i64) -> i64 {
    let quotient = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        quotient - 1
    } else {
        quotient
    }
}

fn floor_mod(a: i64, b: i64) -> i64 {
    let remainder = a.wrapping_rem(b);
    if remainder != 0 && ((remainder < 0) != (b < 0)) {
        remainder + b
    } else {
        remainder
    }
}

fn float_binary(op: BinOp, a: f64, b: f64) -> ExecResult<Value> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(zero_division("float modulo"));
            }
            let remainder = a % b;
            if remainder != 0.0 && ((remainder < 0.0) != (b < 0.0)) {
                remainder + b
            } else {
                remainder
            }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(zero_division("0.0 cannot be raised to a negative power"));
            }
            a.powf(b)
        }
    };
    Ok(Value::Float(value))
}

/// Unary minus.
pub(crate) fn negate(value: &Value) -> ExecResult<Value> {
    match value {
        Value::Int(_) | Value::Bool(_) => value
            .as_int()
            .and_then(i64::checked_neg)
            .map(Value::Int)
            .ok_or_else(overflow),
        Value::Float(f) => Ok(Value::Float(-f)),
        other => Err(Exception::type_error(format!(
            "bad operand type for unary -: '{}'",
            other.type_name()
        ))),
    }
}

/// Unary plus.
pub(crate) fn positive(value: &Value) -> ExecResult<Value> {
    match value {
        Value::Int(_) | Value::Bool(_) => Ok(Value::Int(value.as_int().unwrap_or(0))),
        Value::Float(_) => Ok(value.clone()),
        other => Err(Exception::type_error(format!(
            "bad operand type for unary +: '{}'",
            other.type_name()
        ))),
    }
}

/// Structural equality (`==`).
pub(crate) fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => {
            if Arc::ptr_eq(a, b) {
                return true;
            }
            let (a, b) = (lock(a).clone(), lock(b).clone());
            sequences_equal(&a, &b)
        }
        (Value::Tuple(a), Value::Tuple(b)) => sequences_equal(a, b),
        (Value::Dict(a), Value::Dict(b)) => {
            if Arc::ptr_eq(a, b) {
                return true;
            }
            let a = lock(a).clone();
            let b = lock(b).clone();
            a.len() == b.len()
                && a.iter()
                    .all(|(key, value)| {
                        b.get(key).is_some_and(|other| guarded(|| equals(value, other)))
                    })
        }
        (Value::Range(a), Value::Range(b)) => a.iter().eq(b.iter()),
        _ => match (int_operand(left), int_operand(right)) {
            (Some(a), Some(b)) => a == b,
            _ => match (left.as_float(), right.as_float()) {
                (Some(a), Some(b)) => a == b,
                _ => left.is_same(right),
            },
        },
    }
}

fn sequences_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| guarded(|| equals(x, y)))
}

/// Ordering used by `<`, `sorted`, `min` and `max`. `Ok(None)` means the
/// values are unordered (NaN).
pub(crate) fn compare(left: &Value, right: &Value, symbol: &str) -> ExecResult<Option<Ordering>> {
    if let (Some(a), Some(b)) = (int_operand(left), int_operand(right)) {
        return Ok(Some(a.cmp(&b)));
    }
    if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
        return Ok(a.partial_cmp(&b));
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        (Value::List(_), Value::List(_)) | (Value::Tuple(_), Value::Tuple(_)) => {
            let a = left.sequence_items().unwrap_or_default();
            let b = right.sequence_items().unwrap_or_default();
            for (x, y) in a.iter().zip(&b) {
                if !equals(x, y) {
                    return guarded(|| compare(x, y, symbol));
                }
            }
            Ok(Some(a.len().cmp(&b.len())))
        }
        _ => Err(Exception::type_error(format!(
            "'{symbol}' not supported between instances of '{}' and '{}'",
            left.type_name(),
            right.type_name()
        ))),
    }
}

/// Membership test (`needle in haystack`).
pub(crate) fn contains(haystack: &Value, needle: &Value) -> ExecResult<bool> {
    match haystack {
        Value::Str(text) => match needle {
            Value::Str(part) => Ok(text.contains(part.as_str())),
            other => Err(Exception::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(_) | Value::Tuple(_) => Ok(haystack
            .sequence_items()
            .unwrap_or_default()
            .iter()
            .any(|item| equals(item, needle))),
        Value::Dict(entries) => {
            let key = Key::from_value(needle)?;
            Ok(lock(entries).contains_key(&key))
        }
        Value::Range(range) => Ok(int_operand(needle).is_some_and(|i| range.contains(i))),
        Value::Namespace(ns) => Ok(needle.as_str().is_some_and(|name| ns.get(name).is_some())),
        other => Err(Exception::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

/// Materialises the items of an iterable value.
pub(crate) fn iterate(value: &Value) -> ExecResult<Vec<Value>> {
    match value {
        Value::List(_) | Value::Tuple(_) => Ok(value.sequence_items().unwrap_or_default()),
        Value::Str(text) => Ok(text.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Dict(entries) => Ok(lock(entries).keys().map(Key::to_value).collect()),
        Value::Range(range) => {
            ensure_size(range.len())?;
            Ok(range.iter().map(Value::Int).collect())
        }
        other => Err(Exception::type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

/// Resolves a possibly negative index against `len`.
pub(crate) fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { index + len } else { index };
    if (0..len).contains(&resolved) {
        usize::try_from(resolved).ok()
    } else {
        None
    }
}

fn index_operand(container: &Value, index: &Value) -> ExecResult<i64> {
    int_operand(index).ok_or_else(|| {
        Exception::type_error(format!(
            "{} indices must be integers or slices, not {}",
            container.type_name(),
            index.type_name()
        ))
    })
}

fn index_error(container: &str) -> Exception {
    Exception::new(
        ExceptionKind::IndexError,
        format!("{container} index out of range"),
    )
}

/// `container[index]`.
pub(crate) fn get_item(container: &Value, index: &Value) -> ExecResult<Value> {
    match container {
        Value::List(items) => {
            let i = index_operand(container, index)?;
            let items = lock(items);
            normalize_index(i, items.len())
                .map(|at| items[at].clone())
                .ok_or_else(|| index_error("list"))
        }
        Value::Tuple(items) => {
            let i = index_operand(container, index)?;
            normalize_index(i, items.len())
                .map(|at| items[at].clone())
                .ok_or_else(|| index_error("tuple"))
        }
        Value::Str(text) => {
            let i = index_operand(container, index)?;
            let len = text.chars().count();
            normalize_index(i, len)
                .and_then(|at| text.chars().nth(at))
                .map(|c| Value::Str(c.to_string()))
                .ok_or_else(|| index_error("string"))
        }
        Value::Range(range) => {
            let i = index_operand(container, index)?;
            normalize_index(i, range.len())
                .and_then(|at| range.get(at))
                .map(Value::Int)
                .ok_or_else(|| {
                    Exception::new(ExceptionKind::IndexError, "range object index out of range")
                })
        }
        Value::Dict(entries) => {
            let key = Key::from_value(index)?;
            lock(entries)
                .get(&key)
                .cloned()
                .ok_or_else(|| Exception::new(ExceptionKind::KeyError, index.repr()))
        }
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// `container[index] = value`.
pub(crate) fn set_item(container: &Value, index: &Value, value: Value) -> ExecResult<()> {
    match container {
        Value::List(items) => {
            let i = index_operand(container, index)?;
            let mut items = lock(items);
            let len = items.len();
            let at = normalize_index(i, len).ok_or_else(|| {
                Exception::new(ExceptionKind::IndexError, "list assignment index out of range")
            })?;
            items[at] = value;
            Ok(())
        }
        Value::Dict(entries) => {
            let key = Key::from_value(index)?;
            lock(entries).insert(key, value);
            Ok(())
        }
        other => Err(Exception::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// `del container[index]`.
pub(crate) fn delete_item(container: &Value, index: &Value) -> ExecResult<()> {
    match container {
        Value::List(items) => {
            let i = index_operand(container, index)?;
            let mut items = lock(items);
            let len = items.len();
            let at = normalize_index(i, len).ok_or_else(|| {
                Exception::new(ExceptionKind::IndexError, "list assignment index out of range")
            })?;
            items.remove(at);
            Ok(())
        }
        Value::Dict(entries) => {
            let key = Key::from_value(index)?;
            lock(entries)
                .shift_remove(&key)
                .map(|_| ())
                .ok_or_else(|| Exception::new(ExceptionKind::KeyError, index.repr()))
        }
        other => Err(Exception::type_error(format!(
            "'{}' object does not support item deletion",
            other.type_name()
        ))),
    }
}

/// Python slice semantics: the indices selected by `[lower:upper:step]`.
pub(crate) fn slice_indices(
    len: usize,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> ExecResult<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Exception::value_error("slice step cannot be zero"));
    }
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let clamp = |bound: i64, low: i64, high: i64| {
        let bound = if bound < 0 { bound + len } else { bound };
        bound.clamp(low, high)
    };

    let mut out = Vec::new();
    if step > 0 {
        let start = lower.map_or(0, |b| clamp(b, 0, len));
        let stop = upper.map_or(len, |b| clamp(b, 0, len));
        let mut i = start;
        while i < stop {
            out.extend(usize::try_from(i).ok());
            i += step;
        }
    } else {
        let start = lower.map_or(len - 1, |b| clamp(b, -1, len - 1));
        let stop = upper.map_or(-1, |b| clamp(b, -1, len - 1));
        let mut i = start;
        while i > stop {
            out.extend(usize::try_from(i).ok());
            i += step;
        }
    }
    Ok(out)
}

/// `container[lower:upper:step]`.
pub(crate) fn get_slice(
    container: &Value,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> ExecResult<Value> {
    match container {
        Value::List(_) | Value::Tuple(_) => {
            let items = container.sequence_items().unwrap_or_default();
            let picked: Vec<Value> = slice_indices(items.len(), lower, upper, step)?
                .into_iter()
                .map(|i| items[i].clone())
                .collect();
            Ok(if matches!(container, Value::List(_)) {
                Value::list(picked)
            } else {
                Value::tuple(picked)
            })
        }
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            Ok(Value::Str(
                slice_indices(chars.len(), lower, upper, step)?
                    .into_iter()
                    .map(|i| chars[i])
                    .collect(),
            ))
        }
        Value::Range(range) => {
            let items: Vec<i64> = range.iter().collect();
            Ok(Value::list(
                slice_indices(items.len(), lower, upper, step)?
                    .into_iter()
                    .map(|i| Value::Int(items[i]))
                    .collect(),
            ))
        }
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_follows_python_signs() {
        assert!(matches!(binary(BinOp::FloorDiv, &Value::Int(-7), &Value::Int(2)), Ok(Value::Int(-4))));
        assert!(matches!(binary(BinOp::Mod, &Value::Int(-7), &Value::Int(2)), Ok(Value::Int(1))));
        assert!(matches!(binary(BinOp::Mod, &Value::Int(7), &Value::Int(-2)), Ok(Value::Int(-1))));
        assert!(matches!(binary(BinOp::Div, &Value::Int(7), &Value::Int(2)), Ok(Value::Float(f)) if f == 3.5));
        assert!(matches!(binary(BinOp::Pow, &Value::Int(2), &Value::Int(-1)), Ok(Value::Float(f)) if f == 0.5));
        assert!(matches!(binary(BinOp::Add, &Value::Bool(true), &Value::Int(1)), Ok(Value::Int(2))));
    }

    #[test]
    fn overflow_and_zero_division_raise() {
        let err = binary(BinOp::Mul, &Value::Int(i64::MAX), &Value::Int(2)).unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::OverflowError);
        let err = binary(BinOp::Div, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::ZeroDivisionError);
        assert_eq!(err.message(), "division by zero");
    }

    #[test]
    fn sequence_operators() {
        let joined = binary(BinOp::Add, &Value::str("a"), &Value::str("b")).unwrap();
        assert_eq!(joined.to_str(), "ab");
        let err = binary(BinOp::Add, &Value::str("a"), &Value::Int(1)).unwrap_err();
        assert_eq!(err.message(), "can only concatenate str (not \"int\") to str");
        let repeated = binary(BinOp::Mul, &Value::list(vec![Value::Int(0)]), &Value::Int(3)).unwrap();
        assert_eq!(repeated.repr(), "[0, 0, 0]");
    }

    #[test]
    fn mixed_numeric_equality_and_ordering() {
        assert!(equals(&Value::Int(1), &Value::Float(1.0)));
        assert!(equals(&Value::Bool(true), &Value::Int(1)));
        assert!(!equals(&Value::str("1"), &Value::Int(1)));
        assert_eq!(
            compare(&Value::tuple(vec![Value::Int(1), Value::Int(2)]), &Value::tuple(vec![Value::Int(1), Value::Int(3)]), "<").unwrap(),
            Some(Ordering::Less)
        );
        assert!(compare(&Value::str("a"), &Value::Int(1), "<").is_err());
    }

    #[test]
    fn slicing_matches_python() {
        assert_eq!(slice_indices(5, None, None, Some(-1)).unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(slice_indices(5, Some(1), Some(-1), None).unwrap(), vec![1, 2, 3]);
        assert_eq!(slice_indices(5, Some(-2), None, None).unwrap(), vec![3, 4]);
        assert_eq!(slice_indices(3, Some(10), None, None).unwrap(), Vec::<usize>::new());
        let text = get_slice(&Value::str("hello"), None, None, Some(2)).unwrap();
        assert_eq!(text.to_str(), "hlo");
    }

    #[test]
    fn indexing_errors() {
        let list = Value::list(vec![Value::Int(1)]);
        assert!(matches!(get_item(&list, &Value::Int(-1)), Ok(Value::Int(1))));
        assert_eq!(get_item(&list, &Value::Int(5)).unwrap_err().kind(), ExceptionKind::IndexError);
        let dict = crate::json::from_json(&serde_json::json!({"a": 1}));
        let err = get_item(&dict, &Value::str("b")).unwrap_err();
        assert_eq!(err.to_string(), "KeyError: 'b'");
    }

    #[test]
    fn oversized_repetition_raises_before_allocating() {
        let err = binary(BinOp::Mul, &Value::str("a"), &Value::Int(10_000_000_000)).unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::MemoryError);
        let err = binary(BinOp::Mul, &Value::Int(i64::MAX), &Value::list(vec![Value::None])).unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::MemoryError);
        let empty = binary(BinOp::Mul, &Value::str(""), &Value::Int(i64::MAX)).unwrap();
        assert_eq!(empty.to_str(), "");
        let negative = binary(BinOp::Mul, &Value::str("ab"), &Value::Int(-3)).unwrap();
        assert_eq!(negative.to_str(), "");
    }

    #[test]
    fn oversized_ranges_are_not_materialized() {
        let range = Value::Range(crate::value::Range::new(0, i64::MAX, 1).unwrap());
        assert_eq!(iterate(&range).unwrap_err().kind(), ExceptionKind::MemoryError);
        let small = Value::Range(crate::value::Range::new(0, 3, 1).unwrap());
        assert_eq!(iterate(&small).unwrap().len(), 3);
    }
}

//! Base utilities: builtin functions, modules, attributes and methods.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;

use crate::error::{Exception, ExceptionKind, ExecResult};
use crate::format::str_format;
use crate::host::{CallArgs, Stream};
use crate::json::{self, DumpOptions};
use crate::ops::{self, ensure_size, equals, iterate, normalize_index};
use crate::value::{Awaitable, BoundMethod, Key, Pending, Range, Value, lock};

/// A function or type provided by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Builtin {
    Print,
    Len,
    Range,
    Enumerate,
    Zip,
    Map,
    Filter,
    Sum,
    Min,
    Max,
    Abs,
    Round,
    Sorted,
    Reversed,
    List,
    Dict,
    Tuple,
    Str,
    Int,
    Float,
    Bool,
    Isinstance,
    Callable,
    Repr,
    Any,
    All,
    Getattr,
    Hasattr,
    JsonDumps,
    JsonLoads,
    AsyncioSleep,
    AsyncioGather,
    MathSqrt,
    MathFloor,
    MathCeil,
    MathPow,
    MathLog,
    MathLog10,
    MathExp,
    MathFabs,
    MathTrunc,
    TimeTime,
    TimeMonotonic,
}

impl Builtin {
    /// Builtins bound by name in every run.
    pub const PRELUDE: [Self; 28] = [
        Self::Print,
        Self::Len,
        Self::Range,
        Self::Enumerate,
        Self::Zip,
        Self::Map,
        Self::Filter,
        Self::Sum,
        Self::Min,
        Self::Max,
        Self::Abs,
        Self::Round,
        Self::Sorted,
        Self::Reversed,
        Self::List,
        Self::Dict,
        Self::Tuple,
        Self::Str,
        Self::Int,
        Self::Float,
        Self::Bool,
        Self::Isinstance,
        Self::Callable,
        Self::Repr,
        Self::Any,
        Self::All,
        Self::Getattr,
        Self::Hasattr,
    ];

    /// Name as seen by snippets.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Len => "len",
            Self::Range => "range",
            Self::Enumerate => "enumerate",
            Self::Zip => "zip",
            Self::Map => "map",
            Self::Filter => "filter",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Abs => "abs",
            Self::Round => "round",
            Self::Sorted => "sorted",
            Self::Reversed => "reversed",
            Self::List => "list",
            Self::Dict => "dict",
            Self::Tuple => "tuple",
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Isinstance => "isinstance",
            Self::Callable => "callable",
            Self::Repr => "repr",
            Self::Any => "any",
            Self::All => "all",
            Self::Getattr => "getattr",
            Self::Hasattr => "hasattr",
            Self::JsonDumps => "dumps",
            Self::JsonLoads => "loads",
            Self::AsyncioSleep => "sleep",
            Self::AsyncioGather => "gather",
            Self::MathSqrt => "sqrt",
            Self::MathFloor => "floor",
            Self::MathCeil => "ceil",
            Self::MathPow => "pow",
            Self::MathLog => "log",
            Self::MathLog10 => "log10",
            Self::MathExp => "exp",
            Self::MathFabs => "fabs",
            Self::MathTrunc => "trunc",
            Self::TimeTime => "time",
            Self::TimeMonotonic => "monotonic",
        }
    }

    /// Returns `true` for builtins that are also types (usable with `isinstance`).
    #[must_use]
    pub const fn is_type(self) -> bool {
        matches!(
            self,
            Self::List
                | Self::Dict
                | Self::Tuple
                | Self::Str
                | Self::Int
                | Self::Float
                | Self::Bool
                | Self::Range
        )
    }
}

/// Built-in modules, pre-bound and importable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Module {
    Json,
    Asyncio,
    Math,
    Sys,
    Time,
}

impl Module {
    /// Every module, in binding order.
    pub const ALL: [Self; 5] = [Self::Json, Self::Asyncio, Self::Math, Self::Sys, Self::Time];

    /// Module name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Asyncio => "asyncio",
            Self::Math => "math",
            Self::Sys => "sys",
            Self::Time => "time",
        }
    }

    pub(crate) fn by_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|module| module.name() == name)
    }

    pub(crate) fn attribute(self, name: &str) -> ExecResult<Value> {
        let value = match (self, name) {
            (Self::Json, "dumps") => Value::Builtin(Builtin::JsonDumps),
            (Self::Json, "loads") => Value::Builtin(Builtin::JsonLoads),
            (Self::Asyncio, "sleep") => Value::Builtin(Builtin::AsyncioSleep),
            (Self::Asyncio, "gather") => Value::Builtin(Builtin::AsyncioGather),
            (Self::Math, "sqrt") => Value::Builtin(Builtin::MathSqrt),
            (Self::Math, "floor") => Value::Builtin(Builtin::MathFloor),
            (Self::Math, "ceil") => Value::Builtin(Builtin::MathCeil),
            (Self::Math, "pow") => Value::Builtin(Builtin::MathPow),
            (Self::Math, "log") => Value::Builtin(Builtin::MathLog),
            (Self::Math, "log10") => Value::Builtin(Builtin::MathLog10),
            (Self::Math, "exp") => Value::Builtin(Builtin::MathExp),
            (Self::Math, "fabs") => Value::Builtin(Builtin::MathFabs),
            (Self::Math, "trunc") => Value::Builtin(Builtin::MathTrunc),
            (Self::Math, "pi") => Value::Float(std::f64::consts::PI),
            (Self::Math, "e") => Value::Float(std::f64::consts::E),
            (Self::Math, "inf") => Value::Float(f64::INFINITY),
            (Self::Math, "nan") => Value::Float(f64::NAN),
            (Self::Sys, "stdout") => Value::Stream(Stream::Stdout),
            (Self::Sys, "stderr") => Value::Stream(Stream::Stderr),
            (Self::Time, "time") => Value::Builtin(Builtin::TimeTime),
            (Self::Time, "monotonic") => Value::Builtin(Builtin::TimeMonotonic),
            _ => {
                return Err(Exception::new(
                    ExceptionKind::AttributeError,
                    format!("module '{}' has no attribute '{name}'", self.name()),
                ));
            }
        };
        Ok(value)
    }
}

const STR_METHODS: [&str; 28] = [
    "upper", "lower", "strip", "lstrip", "rstrip", "split", "splitlines", "join", "replace",
    "startswith", "endswith", "find", "index", "count", "title", "capitalize", "isdigit",
    "isalpha", "isalnum", "isspace", "format", "ljust", "rjust", "center", "zfill", "isupper",
    "islower", "swapcase",
];

const LIST_METHODS: [&str; 11] = [
    "append", "extend", "pop", "insert", "remove", "index", "count", "reverse", "copy", "clear",
    "sort",
];

const DICT_METHODS: [&str; 9] = [
    "get", "keys", "values", "items", "update", "pop", "setdefault", "copy", "clear",
];

fn attribute_error(value: &Value, name: &str) -> Exception {
    Exception::new(
        ExceptionKind::AttributeError,
        format!("'{}' object has no attribute '{name}'", value.type_name()),
    )
}

/// `value.name` for everything except calls.
pub(crate) fn get_attribute(value: &Value, name: &str) -> ExecResult<Value> {
    let is_method = match value {
        Value::Namespace(ns) => return ns.member(name),
        Value::Module(module) => return module.attribute(name),
        Value::Exception(exc) if name == "args" => {
            return Ok(if exc.message().is_empty() {
                Value::tuple(Vec::new())
            } else {
                Value::tuple(vec![Value::str(exc.message())])
            });
        }
        Value::Str(_) => STR_METHODS.contains(&name),
        Value::List(_) => LIST_METHODS.contains(&name),
        Value::Dict(_) => DICT_METHODS.contains(&name),
        Value::Stream(_) => matches!(name, "write" | "flush"),
        Value::Function(function) if name == "__name__" => return Ok(Value::str(function.name())),
        _ => false,
    };
    if is_method {
        Ok(Value::Method(Arc::new(BoundMethod {
            receiver: value.clone(),
            name: name.to_owned(),
        })))
    } else {
        Err(attribute_error(value, name))
    }
}

fn one(args: CallArgs, function: &str) -> ExecResult<Value> {
    args.reject_keywords(function)?;
    args.expect_positional(function, 1, 1)?;
    Ok(args.positional.into_iter().next().unwrap_or_default())
}

fn int_arg(value: &Value) -> ExecResult<i64> {
    value.as_int().ok_or_else(|| {
        Exception::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}

fn float_arg(value: &Value, function: &str) -> ExecResult<f64> {
    value.as_float().ok_or_else(|| {
        Exception::type_error(format!(
            "{function}() argument must be a real number, not '{}'",
            value.type_name()
        ))
    })
}

fn str_arg<'v>(value: &'v Value, function: &str) -> ExecResult<&'v str> {
    value.as_str().ok_or_else(|| {
        Exception::type_error(format!(
            "{function}() argument must be str, not {}",
            value.type_name()
        ))
    })
}

fn math_domain() -> Exception {
    Exception::value_error("math domain error")
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn float_to_int(value: f64) -> ExecResult<i64> {
    if value.is_nan() {
        return Err(Exception::value_error("cannot convert float NaN to integer"));
    }
    if value.is_infinite() || value.abs() >= 9.223_372_036_854_776e18 {
        return Err(Exception::new(
            ExceptionKind::OverflowError,
            "cannot convert float infinity to integer",
        ));
    }
    Ok(value as i64)
}

/// Returns `true` when `value` is an instance of `class` (a type, an
/// exception class or a tuple of those).
pub(crate) fn is_instance(value: &Value, class: &Value) -> ExecResult<bool> {
    Ok(match class {
        Value::Builtin(builtin) if builtin.is_type() => match builtin {
            Builtin::Int => matches!(value, Value::Int(_) | Value::Bool(_)),
            Builtin::Float => matches!(value, Value::Float(_)),
            Builtin::Str => matches!(value, Value::Str(_)),
            Builtin::List => matches!(value, Value::List(_)),
            Builtin::Dict => matches!(value, Value::Dict(_)),
            Builtin::Tuple => matches!(value, Value::Tuple(_)),
            Builtin::Bool => matches!(value, Value::Bool(_)),
            _ => matches!(value, Value::Range(_)),
        },
        Value::ExceptionType(kind) => {
            matches!(value, Value::Exception(exc) if exc.kind().is_subclass_of(*kind))
        }
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if is_instance(value, class)? {
                    return Ok(true);
                }
            }
            false
        }
        _ => {
            return Err(Exception::type_error(
                "isinstance() arg 2 must be a type, a tuple of types, or a union",
            ));
        }
    })
}

fn parse_int(text: &str, base: u32) -> ExecResult<i64> {
    let invalid = || {
        Exception::value_error(format!(
            "invalid literal for int() with base {base}: {}",
            Value::str(text).repr()
        ))
    };
    let trimmed = text.trim().replace('_', "");
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest.to_owned()),
        None => (false, trimmed.strip_prefix('+').unwrap_or(&trimmed).to_owned()),
    };
    let lowered = digits.to_ascii_lowercase();
    let digits = match base {
        16 => lowered.strip_prefix("0x").unwrap_or(&lowered),
        8 => lowered.strip_prefix("0o").unwrap_or(&lowered),
        2 => lowered.strip_prefix("0b").unwrap_or(&lowered),
        _ => &lowered,
    };
    if digits.is_empty() {
        return Err(invalid());
    }
    let magnitude = i128::from_str_radix(digits, base).map_err(|_| invalid())?;
    let value = if negative { -magnitude } else { magnitude };
    i64::try_from(value)
        .map_err(|_| Exception::new(ExceptionKind::OverflowError, "int too large to convert"))
}

fn parse_float(text: &str) -> ExecResult<f64> {
    let trimmed = text.trim();
    let lowered = trimmed.to_ascii_lowercase();
    let unsigned = lowered.trim_start_matches(['+', '-']);
    let negative = lowered.starts_with('-');
    let special = match unsigned {
        "inf" | "infinity" => Some(f64::INFINITY),
        "nan" => Some(f64::NAN),
        _ => None,
    };
    if let Some(value) = special {
        return Ok(if negative { -value } else { value });
    }
    trimmed.replace('_', "").parse::<f64>().map_err(|_| {
        Exception::value_error(format!(
            "could not convert string to float: {}",
            Value::str(text).repr()
        ))
    })
}

fn round_value(number: &Value, digits: Option<&Value>) -> ExecResult<Value> {
    let digits = match digits {
        None | Some(Value::None) => None,
        Some(value) => Some(int_arg(value)?),
    };
    match (number, digits) {
        (Value::Int(_) | Value::Bool(_), None) => Ok(Value::Int(number.as_int().unwrap_or(0))),
        (Value::Int(_) | Value::Bool(_), Some(d)) if d >= 0 => {
            Ok(Value::Int(number.as_int().unwrap_or(0)))
        }
        (Value::Int(_) | Value::Bool(_), Some(d)) => {
            let value = number.as_int().unwrap_or(0);
            let factor = 10_i64
                .checked_pow(u32::try_from(-d).unwrap_or(u32::MAX))
                .unwrap_or(i64::MAX);
            let rounded = number_round_half_even(value, factor);
            Ok(Value::Int(rounded))
        }
        (Value::Float(f), None) => float_to_int(f.round_ties_even()).map(Value::Int),
        (Value::Float(f), Some(d)) if d >= 0 && f.is_finite() => {
            let decimals = usize::try_from(d.min(17)).unwrap_or(17);
            let text = format!("{f:.decimals$}");
            Ok(Value::Float(text.parse().unwrap_or(*f)))
        }
        (Value::Float(f), Some(d)) if f.is_finite() => {
            let factor = 10_f64.powi(i32::try_from(-d).unwrap_or(i32::MAX));
            Ok(Value::Float((f / factor).round_ties_even() * factor))
        }
        (Value::Float(f), Some(_)) => Ok(Value::Float(*f)),
        (other, _) => Err(Exception::type_error(format!(
            "type {} doesn't define __round__ method",
            other.type_name()
        ))),
    }
}

fn number_round_half_even(value: i64, factor: i64) -> i64 {
    let quotient = value.div_euclid(factor);
    let remainder = value.rem_euclid(factor);
    let doubled = remainder.saturating_mul(2);
    let bump = doubled > factor || (doubled == factor && quotient % 2 != 0);
    quotient.saturating_add(i64::from(bump)).saturating_mul(factor)
}

fn dict_from_args(args: CallArgs) -> ExecResult<Value> {
    if args.positional.len() > 1 {
        return Err(Exception::type_error(format!(
            "dict expected at most 1 argument, got {}",
            args.positional.len()
        )));
    }
    let mut entries = IndexMap::new();
    if let Some(source) = args.positional.first() {
        merge_into(&mut entries, source)?;
    }
    for (name, value) in args.keywords {
        entries.insert(Key::Str(name), value);
    }
    Ok(Value::dict(entries))
}

fn merge_into(entries: &mut IndexMap<Key, Value>, source: &Value) -> ExecResult<()> {
    if let Value::Dict(other) = source {
        let snapshot: Vec<(Key, Value)> = lock(other)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.extend(snapshot);
        return Ok(());
    }
    for (i, item) in iterate(source)?.into_iter().enumerate() {
        let pair = iterate(&item).map_err(|_| {
            Exception::type_error(format!(
                "cannot convert dictionary update sequence element #{i} to a sequence"
            ))
        })?;
        let [key, value] = <[Value; 2]>::try_from(pair).map_err(|pair| {
            Exception::value_error(format!(
                "dictionary update sequence element #{i} has length {}; 2 is required",
                pair.len()
            ))
        })?;
        entries.insert(Key::from_value(&key)?, value);
    }
    Ok(())
}

fn dump_options(args: &mut CallArgs) -> ExecResult<DumpOptions> {
    let indent = match args.take_keyword("indent") {
        None | Some(Value::None) => None,
        Some(Value::Str(s)) => Some(s),
        Some(value) => {
            let width = ensure_size(usize::try_from(int_arg(&value)?).unwrap_or(0))?;
            Some(" ".repeat(width))
        }
    };
    let sort_keys = args
        .take_keyword("sort_keys")
        .is_some_and(|value| value.is_truthy());
    let ensure_ascii = args
        .take_keyword("ensure_ascii")
        .is_none_or(|value| value.is_truthy());
    args.take_keyword("default");
    args.reject_keywords("dumps")?;
    Ok(DumpOptions {
        indent,
        sort_keys,
        ensure_ascii,
    })
}

fn monotonic_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Calls a builtin that needs no interpreter callbacks.
///
/// `print`, `map`, `filter`, `sorted`, `min` and `max` are driven by the
/// interpreter and never reach this function.
pub(crate) fn call(builtin: Builtin, mut args: CallArgs) -> ExecResult<Value> {
    let name = builtin.name();
    match builtin {
        Builtin::Len => {
            let value = one(args, name)?;
            let len = match &value {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => lock(items).len(),
                Value::Tuple(items) => items.len(),
                Value::Dict(entries) => lock(entries).len(),
                Value::Range(range) => range.len(),
                Value::Namespace(ns) => ns.len(),
                other => {
                    return Err(Exception::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )));
                }
            };
            Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
        }
        Builtin::Range => {
            args.reject_keywords(name)?;
            args.expect_positional(name, 1, 3)?;
            let ints = args
                .positional
                .iter()
                .map(int_arg)
                .collect::<ExecResult<Vec<_>>>()?;
            let range = match *ints.as_slice() {
                [start, stop, step] => Range::new(start, stop, step)?,
                [start, stop] => Range::new(start, stop, 1)?,
                [stop] => Range::new(0, stop, 1)?,
                _ => Range::new(0, 0, 1)?,
            };
            Ok(Value::Range(range))
        }
        Builtin::Enumerate => {
            let start = match args.take_keyword("start") {
                Some(value) => int_arg(&value)?,
                None => args.positional.get(1).map(int_arg).transpose()?.unwrap_or(0),
            };
            args.reject_keywords(name)?;
            args.expect_positional(name, 1, 2)?;
            let items = iterate(&args.positional[0])?;
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                let index = i64::try_from(i)
                    .ok()
                    .and_then(|i| start.checked_add(i))
                    .ok_or_else(|| Exception::new(ExceptionKind::OverflowError, "integer overflow"))?;
                out.push(Value::tuple(vec![Value::Int(index), item]));
            }
            Ok(Value::list(out))
        }
        Builtin::Zip => {
            args.reject_keywords(name)?;
            let columns = args
                .positional
                .iter()
                .map(iterate)
                .collect::<ExecResult<Vec<_>>>()?;
            let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::list(
                (0..rows)
                    .map(|row| Value::tuple(columns.iter().map(|col| col[row].clone()).collect()))
                    .collect(),
            ))
        }
        Builtin::Sum => {
            let start = args.take_keyword("start");
            args.reject_keywords(name)?;
            args.expect_positional(name, 1, 2)?;
            let mut total = start
                .or_else(|| args.positional.get(1).cloned())
                .unwrap_or(Value::Int(0));
            if matches!(total, Value::Str(_)) {
                return Err(Exception::type_error(
                    "sum() can't sum strings [use ''.join(seq) instead]",
                ));
            }
            for item in iterate(&args.positional[0])? {
                total = ops::binary(crate::ast::BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        Builtin::Abs => match one(args, name)? {
            Value::Float(f) => Ok(Value::Float(f.abs())),
            value @ (Value::Int(_) | Value::Bool(_)) => value
                .as_int()
                .and_then(i64::checked_abs)
                .map(Value::Int)
                .ok_or_else(|| Exception::new(ExceptionKind::OverflowError, "integer overflow")),
            other => Err(Exception::type_error(format!(
                "bad operand type for abs(): '{}'",
                other.type_name()
            ))),
        },
        Builtin::Round => {
            let digits = args.take_keyword("ndigits");
            args.reject_keywords(name)?;
            args.expect_positional(name, 1, 2)?;
            let digits = digits.or_else(|| args.positional.get(1).cloned());
            round_value(&args.positional[0], digits.as_ref())
        }
        Builtin::Reversed => {
            let value = one(args, name)?;
            let mut items = match &value {
                Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Range(_) | Value::Dict(_) => {
                    iterate(&value)?
                }
                other => {
                    return Err(Exception::type_error(format!(
                        "'{}' object is not reversible",
                        other.type_name()
                    )));
                }
            };
            items.reverse();
            Ok(Value::list(items))
        }
        Builtin::List => {
            args.reject_keywords(name)?;
            args.expect_positional(name, 0, 1)?;
            match args.positional.first() {
                Some(source) => Ok(Value::list(iterate(source)?)),
                None => Ok(Value::list(Vec::new())),
            }
        }
        Builtin::Tuple => {
            args.reject_keywords(name)?;
            args.expect_positional(name, 0, 1)?;
            match args.positional.first() {
                Some(source) => Ok(Value::tuple(iterate(source)?)),
                None => Ok(Value::tuple(Vec::new())),
            }
        }
        Builtin::Dict => dict_from_args(args),
        Builtin::Str => {
            args.reject_keywords(name)?;
            args.expect_positional(name, 0, 1)?;
            Ok(Value::Str(
                args.positional.first().map(Value::to_str).unwrap_or_default(),
            ))
        }
        Builtin::Int => {
            let base = args.take_keyword("base");
            args.reject_keywords(name)?;
            args.expect_positional(name, 0, 2)?;
            let base = base.or_else(|| args.positional.get(1).cloned());
            let Some(value) = args.positional.first() else {
                return Ok(Value::Int(0));
            };
            match (value, base) {
                (Value::Str(text), Some(base)) => {
                    let base = u32::try_from(int_arg(&base)?)
                        .ok()
                        .filter(|b| (2..=36).contains(b))
                        .ok_or_else(|| Exception::value_error("int() base must be >= 2 and <= 36"))?;
                    parse_int(text, base).map(Value::Int)
                }
                (Value::Str(text), None) => parse_int(text, 10).map(Value::Int),
                (_, Some(_)) => Err(Exception::type_error(
                    "int() can't convert non-string with explicit base",
                )),
                (Value::Int(_) | Value::Bool(_), None) => Ok(Value::Int(value.as_int().unwrap_or(0))),
                (Value::Float(f), None) => float_to_int(f.trunc()).map(Value::Int),
                (other, None) => Err(Exception::type_error(format!(
                    "int() argument must be a string, a bytes-like object or a real number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Float => {
            args.reject_keywords(name)?;
            args.expect_positional(name, 0, 1)?;
            match args.positional.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(text)) => parse_float(text).map(Value::Float),
                Some(value) => value.as_float().map(Value::Float).ok_or_else(|| {
                    Exception::type_error(format!(
                        "float() argument must be a string or a real number, not '{}'",
                        value.type_name()
                    ))
                }),
            }
        }
        Builtin::Bool => {
            args.reject_keywords(name)?;
            args.expect_positional(name, 0, 1)?;
            Ok(Value::Bool(args.positional.first().is_some_and(Value::is_truthy)))
        }
        Builtin::Isinstance => {
            args.reject_keywords(name)?;
            args.expect_positional(name, 2, 2)?;
            is_instance(&args.positional[0], &args.positional[1]).map(Value::Bool)
        }
        Builtin::Callable => Ok(Value::Bool(one(args, name)?.is_callable())),
        Builtin::Repr => Ok(Value::Str(one(args, name)?.repr())),
        Builtin::Any => {
            let items = iterate(&one(args, name)?)?;
            Ok(Value::Bool(items.iter().any(Value::is_truthy)))
        }
        Builtin::All => {
            let items = iterate(&one(args, name)?)?;
            Ok(Value::Bool(items.iter().all(Value::is_truthy)))
        }
        Builtin::Getattr => {
            args.reject_keywords(name)?;
            args.expect_positional(name, 2, 3)?;
            let attribute = str_arg(&args.positional[1], name)?;
            match get_attribute(&args.positional[0], attribute) {
                Ok(value) => Ok(value),
                Err(err)
                    if args.positional.len() == 3
                        && matches!(
                            err.kind(),
                            ExceptionKind::AttributeError | ExceptionKind::CapabilityNotFound
                        ) =>
                {
                    Ok(args.positional[2].clone())
                }
                Err(err) => Err(err),
            }
        }
        Builtin::Hasattr => {
            args.reject_keywords(name)?;
            args.expect_positional(name, 2, 2)?;
            let attribute = str_arg(&args.positional[1], name)?;
            Ok(Value::Bool(get_attribute(&args.positional[0], attribute).is_ok()))
        }
        Builtin::JsonDumps => {
            let options = dump_options(&mut args)?;
            args.expect_positional(name, 1, 1)?;
            json::dumps(&args.positional[0], &options).map(Value::Str)
        }
        Builtin::JsonLoads => {
            let value = one(args, name)?;
            json::loads(str_arg(&value, name)?)
        }
        Builtin::AsyncioSleep => {
            args.reject_keywords(name)?;
            args.expect_positional(name, 1, 2)?;
            let seconds = float_arg(&args.positional[0], name)?;
            let delay = if seconds.is_finite() && seconds > 0.0 {
                Duration::from_secs_f64(seconds.min(1.0e9))
            } else {
                Duration::ZERO
            };
            Ok(Value::Awaitable(Awaitable::new("sleep", Pending::Sleep(delay))))
        }
        Builtin::AsyncioGather => {
            args.reject_keywords(name)?;
            Ok(Value::Awaitable(Awaitable::new(
                "gather",
                Pending::Gather(args.positional),
            )))
        }
        Builtin::MathSqrt => {
            let x = float_arg(&one(args, name)?, name)?;
            if x < 0.0 {
                return Err(math_domain());
            }
            Ok(Value::Float(x.sqrt()))
        }
        Builtin::MathFloor | Builtin::MathCeil | Builtin::MathTrunc => {
            let value = one(args, name)?;
            if let Value::Int(_) | Value::Bool(_) = value {
                return Ok(Value::Int(value.as_int().unwrap_or(0)));
            }
            let x = float_arg(&value, name)?;
            let rounded = match builtin {
                Builtin::MathFloor => x.floor(),
                Builtin::MathCeil => x.ceil(),
                _ => x.trunc(),
            };
            float_to_int(rounded).map(Value::Int)
        }
        Builtin::MathPow => {
            args.reject_keywords(name)?;
            args.expect_positional(name, 2, 2)?;
            let base = float_arg(&args.positional[0], name)?;
            let exponent = float_arg(&args.positional[1], name)?;
            if base == 0.0 && exponent < 0.0 {
                return Err(math_domain());
            }
            Ok(Value::Float(base.powf(exponent)))
        }
        Builtin::MathLog => {
            args.reject_keywords(name)?;
            args.expect_positional(name, 1, 2)?;
            let x = float_arg(&args.positional[0], name)?;
            if x <= 0.0 {
                return Err(math_domain());
            }
            match args.positional.get(1) {
                Some(base) => {
                    let base = float_arg(base, name)?;
                    if base <= 0.0 || base == 1.0 {
                        return Err(math_domain());
                    }
                    Ok(Value::Float(x.ln() / base.ln()))
                }
                None => Ok(Value::Float(x.ln())),
            }
        }
        Builtin::MathLog10 => {
            let x = float_arg(&one(args, name)?, name)?;
            if x <= 0.0 {
                return Err(math_domain());
            }
            Ok(Value::Float(x.log10()))
        }
        Builtin::MathExp => {
            let x = float_arg(&one(args, name)?, name)?;
            let result = x.exp();
            if result.is_infinite() && x.is_finite() {
                return Err(Exception::new(ExceptionKind::OverflowError, "math range error"));
            }
            Ok(Value::Float(result))
        }
        Builtin::MathFabs => Ok(Value::Float(float_arg(&one(args, name)?, name)?.abs())),
        Builtin::TimeTime => {
            args.expect_positional(name, 0, 0)?;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            Ok(Value::Float(now.as_secs_f64()))
        }
        Builtin::TimeMonotonic => {
            args.expect_positional(name, 0, 0)?;
            Ok(Value::Float(monotonic_start().elapsed().as_secs_f64()))
        }
        Builtin::Print
        | Builtin::Map
        | Builtin::Filter
        | Builtin::Sorted
        | Builtin::Min
        | Builtin::Max => Err(Exception::runtime_error(format!(
            "{name}() must be called by the interpreter"
        ))),
    }
}

fn optional_positional(args: &CallArgs, index: usize, keyword: &str) -> Option<Value> {
    args.keywords
        .get(keyword)
        .cloned()
        .or_else(|| args.positional.get(index).cloned())
}

fn strip_set<'s>(text: &'s str, chars: Option<&Value>, left: bool, right: bool) -> ExecResult<&'s str> {
    let set: Option<Vec<char>> = match chars {
        None | Some(Value::None) => None,
        Some(Value::Str(s)) => Some(s.chars().collect()),
        Some(other) => {
            return Err(Exception::type_error(format!(
                "strip arg must be None or str, not {}",
                other.type_name()
            )));
        }
    };
    let matches = |c: char| set.as_ref().map_or(c.is_whitespace(), |set| set.contains(&c));
    let mut out = text;
    if left {
        out = out.trim_start_matches(matches);
    }
    if right {
        out = out.trim_end_matches(matches);
    }
    Ok(out)
}

fn char_index(text: &str, byte_index: usize) -> i64 {
    i64::try_from(text[..byte_index].chars().count()).unwrap_or(i64::MAX)
}

fn affix_matches(value: &Value, check: impl Fn(&str) -> bool, method: &str) -> ExecResult<bool> {
    match value {
        Value::Str(affix) => Ok(check(affix)),
        Value::Tuple(items) => Ok(items.iter().any(|item| item.as_str().is_some_and(&check))),
        other => Err(Exception::type_error(format!(
            "{method} first arg must be str or a tuple of str, not {}",
            other.type_name()
        ))),
    }
}

fn justify(text: &str, args: &CallArgs, method: &str) -> ExecResult<Value> {
    args.expect_positional(method, 1, 2)?;
    let width = ensure_size(usize::try_from(int_arg(&args.positional[0])?).unwrap_or(0))?;
    let fill = match args.positional.get(1) {
        Some(Value::Str(f)) if f.chars().count() == 1 => f.chars().next().unwrap_or(' '),
        Some(_) => {
            return Err(Exception::type_error(
                "The fill character must be exactly one character long",
            ));
        }
        None => ' ',
    };
    let len = text.chars().count();
    if len >= width {
        return Ok(Value::str(text));
    }
    let padding = width - len;
    let fill_str = |n: usize| fill.to_string().repeat(n);
    Ok(Value::Str(match method {
        "ljust" => format!("{text}{}", fill_str(padding)),
        "rjust" => format!("{}{text}", fill_str(padding)),
        _ => {
            let left = padding / 2 + (padding & width & 1);
            format!("{}{text}{}", fill_str(left), fill_str(padding - left))
        }
    }))
}

fn str_method(text: &str, method: &str, args: CallArgs) -> ExecResult<Value> {
    if method != "format" && method != "split" {
        args.reject_keywords(method)?;
    }
    let arity = |min: usize, max: usize| args.expect_positional(method, min, max);
    Ok(match method {
        "upper" => {
            arity(0, 0)?;
            Value::Str(text.to_uppercase())
        }
        "lower" => {
            arity(0, 0)?;
            Value::Str(text.to_lowercase())
        }
        "swapcase" => {
            arity(0, 0)?;
            Value::Str(
                text.chars()
                    .flat_map(|c| {
                        if c.is_uppercase() {
                            c.to_lowercase().collect::<Vec<_>>()
                        } else {
                            c.to_uppercase().collect::<Vec<_>>()
                        }
                    })
                    .collect(),
            )
        }
        "strip" | "lstrip" | "rstrip" => {
            arity(0, 1)?;
            let left = method != "rstrip";
            let right = method != "lstrip";
            Value::str(strip_set(text, args.positional.first(), left, right)?)
        }
        "split" => {
            let sep = optional_positional(&args, 0, "sep");
            let maxsplit = optional_positional(&args, 1, "maxsplit")
                .map(|value| int_arg(&value))
                .transpose()?
                .unwrap_or(-1);
            let limit = usize::try_from(maxsplit).ok();
            let parts: Vec<Value> = match sep {
                None | Some(Value::None) => {
                    let mut parts = Vec::new();
                    let mut rest = text.trim_start();
                    while !rest.is_empty() {
                        if limit.is_some_and(|limit| parts.len() == limit) {
                            parts.push(Value::str(rest.trim_end()));
                            break;
                        }
                        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                        parts.push(Value::str(&rest[..end]));
                        rest = rest[end..].trim_start();
                    }
                    parts
                }
                Some(Value::Str(sep)) if sep.is_empty() => {
                    return Err(Exception::value_error("empty separator"));
                }
                Some(Value::Str(sep)) => match limit {
                    Some(limit) => text.splitn(limit + 1, sep.as_str()).map(Value::str).collect(),
                    None => text.split(sep.as_str()).map(Value::str).collect(),
                },
                Some(other) => {
                    return Err(Exception::type_error(format!(
                        "must be str or None, not {}",
                        other.type_name()
                    )));
                }
            };
            Value::list(parts)
        }
        "splitlines" => {
            arity(0, 1)?;
            Value::list(text.lines().map(Value::str).collect())
        }
        "join" => {
            arity(1, 1)?;
            let mut pieces = Vec::new();
            for (i, item) in iterate(&args.positional[0])?.into_iter().enumerate() {
                match item {
                    Value::Str(s) => pieces.push(s),
                    other => {
                        return Err(Exception::type_error(format!(
                            "sequence item {i}: expected str instance, {} found",
                            other.type_name()
                        )));
                    }
                }
            }
            Value::Str(pieces.join(text))
        }
        "replace" => {
            arity(2, 3)?;
            let old = str_arg(&args.positional[0], method)?;
            let new = str_arg(&args.positional[1], method)?;
            match args.positional.get(2).map(int_arg).transpose()? {
                Some(count) if count >= 0 => {
                    Value::Str(text.replacen(old, new, usize::try_from(count).unwrap_or(0)))
                }
                _ => Value::Str(text.replace(old, new)),
            }
        }
        "startswith" => {
            arity(1, 1)?;
            Value::Bool(affix_matches(&args.positional[0], |p| text.starts_with(p), method)?)
        }
        "endswith" => {
            arity(1, 1)?;
            Value::Bool(affix_matches(&args.positional[0], |p| text.ends_with(p), method)?)
        }
        "find" | "index" => {
            arity(1, 1)?;
            let needle = str_arg(&args.positional[0], method)?;
            match text.find(needle) {
                Some(at) => Value::Int(char_index(text, at)),
                None if method == "find" => Value::Int(-1),
                None => return Err(Exception::value_error("substring not found")),
            }
        }
        "count" => {
            arity(1, 1)?;
            let needle = str_arg(&args.positional[0], method)?;
            let count = if needle.is_empty() {
                text.chars().count() + 1
            } else {
                text.matches(needle).count()
            };
            Value::Int(i64::try_from(count).unwrap_or(i64::MAX))
        }
        "title" => {
            arity(0, 0)?;
            let mut out = String::with_capacity(text.len());
            let mut previous_cased = false;
            for c in text.chars() {
                if previous_cased {
                    out.extend(c.to_lowercase());
                } else {
                    out.extend(c.to_uppercase());
                }
                previous_cased = c.is_alphabetic();
            }
            Value::Str(out)
        }
        "capitalize" => {
            arity(0, 0)?;
            let mut chars = text.chars();
            Value::Str(match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            })
        }
        "isdigit" => Value::Bool(!text.is_empty() && text.chars().all(|c| c.is_ascii_digit())),
        "isalpha" => Value::Bool(!text.is_empty() && text.chars().all(char::is_alphabetic)),
        "isalnum" => Value::Bool(!text.is_empty() && text.chars().all(char::is_alphanumeric)),
        "isspace" => Value::Bool(!text.is_empty() && text.chars().all(char::is_whitespace)),
        "isupper" => Value::Bool(
            text.chars().any(char::is_alphabetic) && !text.chars().any(char::is_lowercase),
        ),
        "islower" => Value::Bool(
            text.chars().any(char::is_alphabetic) && !text.chars().any(char::is_uppercase),
        ),
        "format" => Value::Str(str_format(text, &args)?),
        "ljust" | "rjust" | "center" => justify(text, &args, method)?,
        "zfill" => {
            arity(1, 1)?;
            let width = ensure_size(usize::try_from(int_arg(&args.positional[0])?).unwrap_or(0))?;
            let len = text.chars().count();
            if len >= width {
                Value::str(text)
            } else {
                let (sign, digits) = match text.chars().next() {
                    Some(c @ ('+' | '-')) => (c.to_string(), &text[1..]),
                    _ => (String::new(), text),
                };
                Value::Str(format!("{sign}{}{digits}", "0".repeat(width - len)))
            }
        }
        _ => return Err(attribute_error(&Value::str(text), method)),
    })
}

fn list_method(items: &crate::value::ListRef, method: &str, args: CallArgs) -> ExecResult<Value> {
    args.reject_keywords(method)?;
    let arity = |min: usize, max: usize| args.expect_positional(method, min, max);
    Ok(match method {
        "append" => {
            arity(1, 1)?;
            let mut items = lock(items);
            ensure_size(items.len() + 1)?;
            items.push(args.positional[0].clone());
            Value::None
        }
        "extend" => {
            arity(1, 1)?;
            let extra = iterate(&args.positional[0])?;
            let mut items = lock(items);
            ensure_size(items.len().saturating_add(extra.len()))?;
            items.extend(extra);
            Value::None
        }
        "pop" => {
            arity(0, 1)?;
            let index = args.positional.first().map(int_arg).transpose()?.unwrap_or(-1);
            let mut items = lock(items);
            if items.is_empty() {
                return Err(Exception::new(ExceptionKind::IndexError, "pop from empty list"));
            }
            let len = items.len();
            let at = normalize_index(index, len).ok_or_else(|| {
                Exception::new(ExceptionKind::IndexError, "pop index out of range")
            })?;
            items.remove(at)
        }
        "insert" => {
            arity(2, 2)?;
            let index = int_arg(&args.positional[0])?;
            let mut items = lock(items);
            let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(usize::try_from(at).unwrap_or(0), args.positional[1].clone());
            Value::None
        }
        "remove" | "index" | "count" => {
            arity(1, 1)?;
            let needle = &args.positional[0];
            let snapshot = lock(items).clone();
            let position = snapshot.iter().position(|item| equals(item, needle));
            match (method, position) {
                ("count", _) => Value::Int(
                    i64::try_from(snapshot.iter().filter(|item| equals(item, needle)).count())
                        .unwrap_or(i64::MAX),
                ),
                ("index", Some(at)) => Value::Int(i64::try_from(at).unwrap_or(i64::MAX)),
                ("index", None) => {
                    return Err(Exception::value_error(format!("{} is not in list", needle.repr())));
                }
                (_, Some(at)) => {
                    let mut items = lock(items);
                    if at < items.len() {
                        items.remove(at);
                    }
                    Value::None
                }
                (_, None) => return Err(Exception::value_error("list.remove(x): x not in list")),
            }
        }
        "reverse" => {
            arity(0, 0)?;
            lock(items).reverse();
            Value::None
        }
        "copy" => {
            arity(0, 0)?;
            Value::list(lock(items).clone())
        }
        "clear" => {
            arity(0, 0)?;
            lock(items).clear();
            Value::None
        }
        _ => return Err(attribute_error(&Value::List(Arc::clone(items)), method)),
    })
}

fn dict_method(entries: &crate::value::DictRef, method: &str, mut args: CallArgs) -> ExecResult<Value> {
    if method != "update" {
        args.reject_keywords(method)?;
    }
    let arity = |args: &CallArgs, min: usize, max: usize| args.expect_positional(method, min, max);
    Ok(match method {
        "get" => {
            arity(&args, 1, 2)?;
            let key = Key::from_value(&args.positional[0])?;
            let found = lock(entries).get(&key).cloned();
            found.unwrap_or_else(|| args.positional.get(1).cloned().unwrap_or_default())
        }
        "keys" => {
            arity(&args, 0, 0)?;
            Value::list(lock(entries).keys().map(Key::to_value).collect())
        }
        "values" => {
            arity(&args, 0, 0)?;
            Value::list(lock(entries).values().cloned().collect())
        }
        "items" => {
            arity(&args, 0, 0)?;
            Value::list(
                lock(entries)
                    .iter()
                    .map(|(k, v)| Value::tuple(vec![k.to_value(), v.clone()]))
                    .collect(),
            )
        }
        "update" => {
            arity(&args, 0, 1)?;
            let mut incoming = IndexMap::new();
            if let Some(source) = args.positional.first() {
                merge_into(&mut incoming, source)?;
            }
            for (name, value) in std::mem::take(&mut args.keywords) {
                incoming.insert(Key::Str(name), value);
            }
            lock(entries).extend(incoming);
            Value::None
        }
        "pop" => {
            arity(&args, 1, 2)?;
            let key = Key::from_value(&args.positional[0])?;
            let removed = lock(entries).shift_remove(&key);
            match (removed, args.positional.get(1)) {
                (Some(value), _) => value,
                (None, Some(default)) => default.clone(),
                (None, None) => {
                    return Err(Exception::new(ExceptionKind::KeyError, args.positional[0].repr()));
                }
            }
        }
        "setdefault" => {
            arity(&args, 1, 2)?;
            let key = Key::from_value(&args.positional[0])?;
            let default = args.positional.get(1).cloned().unwrap_or_default();
            lock(entries).entry(key).or_insert(default).clone()
        }
        "copy" => {
            arity(&args, 0, 0)?;
            Value::dict(lock(entries).clone())
        }
        "clear" => {
            arity(&args, 0, 0)?;
            lock(entries).clear();
            Value::None
        }
        _ => return Err(attribute_error(&Value::Dict(Arc::clone(entries)), method)),
    })
}

/// Calls a method that needs no interpreter callbacks.
pub(crate) fn call_method(receiver: &Value, method: &str, args: CallArgs) -> ExecResult<Value> {
    match receiver {
        Value::Str(text) => str_method(text, method, args),
        Value::List(items) => list_method(items, method, args),
        Value::Dict(entries) => dict_method(entries, method, args),
        other => Err(attribute_error(other, method)),
    }
}

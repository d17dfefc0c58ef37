//! Number rendering, format specs, `str.format` and `%` interpolation.

use crate::error::{Exception, ExceptionKind, ExecResult};
use crate::host::CallArgs;
use crate::ops::ensure_size;
use crate::value::Value;

/// Shortest round-tripping float text, with Python's switch to exponent
/// notation below `1e-4` and from `1e16` upward.
pub(crate) fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".into();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0.0".into() } else { "0.0".into() };
    }

    let scientific = format!("{:e}", value.abs());
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let sign = if value < 0.0 { "-" } else { "" };

    if (-4..16).contains(&exponent) {
        return format!("{sign}{}", place_point(&digits, exponent));
    }

    let mut mantissa = digits[..1].to_owned();
    if digits.len() > 1 {
        mantissa.push('.');
        mantissa.push_str(&digits[1..]);
    }
    format!("{sign}{mantissa}{}", exponent_suffix('e', exponent))
}

fn place_point(digits: &str, exponent: i32) -> String {
    if exponent < 0 {
        let zeros = "0".repeat(usize::try_from(-exponent - 1).unwrap_or(0));
        return format!("0.{zeros}{digits}");
    }
    let int_len = usize::try_from(exponent + 1).unwrap_or(0);
    if digits.len() <= int_len {
        format!("{digits}{}.0", "0".repeat(int_len - digits.len()))
    } else {
        format!("{}.{}", &digits[..int_len], &digits[int_len..])
    }
}

fn exponent_suffix(marker: char, exponent: i32) -> String {
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{marker}{sign}{:02}", exponent.abs())
}

/// Fixed-point rendering of `value` with `precision` decimals in exponent
/// form, Python style (`1.50e+03`).
fn scientific(value: f64, precision: usize, upper: bool) -> String {
    let text = format!("{value:.precision$e}");
    let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let out = format!("{mantissa}{}", exponent_suffix('e', exponent));
    if upper { out.to_uppercase() } else { out }
}

fn general(value: f64, precision: usize, alternate: bool, upper: bool) -> String {
    let precision = precision.max(1);
    if !value.is_finite() {
        return special_float(value, upper);
    }
    let rounded = format!("{:.*e}", precision - 1, value);
    let exponent: i32 = rounded
        .split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);
    let p = i32::try_from(precision).unwrap_or(i32::MAX);

    let mut text = if (-4..p).contains(&exponent) {
        let decimals = usize::try_from(p - 1 - exponent).unwrap_or(0);
        format!("{value:.decimals$}")
    } else {
        scientific(value, precision - 1, upper)
    };
    if !alternate {
        text = strip_trailing_zeros(&text);
    }
    text
}

fn strip_trailing_zeros(text: &str) -> String {
    let (body, suffix) = match text.find(['e', 'E']) {
        Some(at) => text.split_at(at),
        None => (text, ""),
    };
    if !body.contains('.') {
        return text.to_owned();
    }
    let body = body.trim_end_matches('0').trim_end_matches('.');
    format!("{body}{suffix}")
}

fn special_float(value: f64, upper: bool) -> String {
    let text = if value.is_nan() {
        "nan"
    } else if value > 0.0 {
        "inf"
    } else {
        "-inf"
    };
    if upper { text.to_uppercase() } else { text.to_owned() }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    alternate: bool,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> ExecResult<Spec> {
    let invalid = || Exception::value_error(format!("Invalid format specifier '{spec}'"));
    let chars: Vec<char> = spec.chars().collect();
    let mut parsed = Spec::default();
    let mut i = 0;

    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        parsed.fill = Some(chars[0]);
        parsed.align = Some(chars[1]);
        i = 2;
    } else if chars.first().copied().is_some_and(is_align) {
        parsed.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c @ ('+' | '-' | ' ')) = chars.get(i) {
        parsed.sign = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'#') {
        parsed.alternate = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        parsed.zero = true;
        i += 1;
    }
    let start = i;
    while chars.get(i).is_some_and(char::is_ascii_digit) {
        i += 1;
    }
    if i > start {
        parsed.width = chars[start..i]
            .iter()
            .collect::<String>()
            .parse()
            .map_err(|_| invalid())?;
        ensure_size(parsed.width)?;
    }
    if let Some(&c @ (',' | '_')) = chars.get(i) {
        parsed.grouping = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(char::is_ascii_digit) {
            i += 1;
        }
        if i == start {
            return Err(Exception::value_error("Format specifier missing precision"));
        }
        let precision = chars[start..i]
            .iter()
            .collect::<String>()
            .parse()
            .map_err(|_| invalid())?;
        parsed.precision = Some(ensure_size(precision)?);
    }
    if let Some(&c) = chars.get(i) {
        parsed.kind = Some(c);
        i += 1;
    }
    if i != chars.len() {
        return Err(invalid());
    }
    Ok(parsed)
}

fn group_digits(digits: &str, separator: char) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(separator);
        }
        out.push(c);
    }
    out
}

fn pad(body: &str, sign: &str, spec: &Spec, numeric: bool) -> String {
    let len = body.chars().count() + sign.chars().count();
    let (fill, align) = match (spec.align, spec.zero) {
        (Some(align), _) => (spec.fill.unwrap_or(' '), align),
        (None, true) => (spec.fill.unwrap_or('0'), '='),
        (None, false) => (' ', if numeric { '>' } else { '<' }),
    };
    if len >= spec.width {
        return format!("{sign}{body}");
    }
    let padding = spec.width - len;
    let fill_str = |n: usize| fill.to_string().repeat(n);
    match align {
        '<' => format!("{sign}{body}{}", fill_str(padding)),
        '^' => format!(
            "{}{sign}{body}{}",
            fill_str(padding / 2),
            fill_str(padding - padding / 2)
        ),
        '=' => format!("{sign}{}{body}", fill_str(padding)),
        _ => format!("{}{sign}{body}", fill_str(padding)),
    }
}

fn sign_prefix(negative: bool, spec: &Spec) -> &'static str {
    match (negative, spec.sign) {
        (true, _) => "-",
        (false, Some('+')) => "+",
        (false, Some(' ')) => " ",
        _ => "",
    }
}

fn format_float(value: f64, spec: &Spec) -> ExecResult<String> {
    let kind = spec.kind;
    let upper = matches!(kind, Some('F' | 'E' | 'G'));
    let magnitude = value.abs();
    let mut body = match kind {
        Some('f' | 'F') if !magnitude.is_finite() => special_float(magnitude, upper),
        Some('f' | 'F') => format!("{magnitude:.*}", spec.precision.unwrap_or(6)),
        Some('e' | 'E') if !magnitude.is_finite() => special_float(magnitude, upper),
        Some('e' | 'E') => scientific(magnitude, spec.precision.unwrap_or(6), upper),
        Some('g' | 'G') => general(magnitude, spec.precision.unwrap_or(6), spec.alternate, upper),
        Some('%') => format!("{:.*}%", spec.precision.unwrap_or(6), magnitude * 100.0),
        None => match spec.precision {
            Some(precision) => general(magnitude, precision, spec.alternate, false),
            None => float_repr(magnitude),
        },
        Some(other) => {
            return Err(Exception::value_error(format!(
                "Unknown format code '{other}' for object of type 'float'"
            )));
        }
    };
    if let Some(separator) = spec.grouping {
        let split = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
        body = format!("{}{}", group_digits(&body[..split], separator), &body[split..]);
    }
    let negative = value.is_sign_negative() && !value.is_nan() && value != 0.0;
    Ok(pad(&body, sign_prefix(negative, spec), spec, true))
}

fn format_int(value: i64, spec: &Spec) -> ExecResult<String> {
    let magnitude = value.unsigned_abs();
    let (digits, prefix) = match spec.kind {
        None | Some('d' | 'n') => (magnitude.to_string(), ""),
        Some('x') => (format!("{magnitude:x}"), "0x"),
        Some('X') => (format!("{magnitude:X}"), "0X"),
        Some('o') => (format!("{magnitude:o}"), "0o"),
        Some('b') => (format!("{magnitude:b}"), "0b"),
        Some('c') => {
            let c = u32::try_from(value)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| Exception::new(ExceptionKind::OverflowError, "%c arg not in range(0x110000)"))?;
            return Ok(pad(&c.to_string(), "", spec, false));
        }
        #[allow(clippy::cast_precision_loss)]
        Some('e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%') => return format_float(value as f64, spec),
        Some(other) => {
            return Err(Exception::value_error(format!(
                "Unknown format code '{other}' for object of type 'int'"
            )));
        }
    };
    if spec.precision.is_some() {
        return Err(Exception::value_error(
            "Precision not allowed in integer format specifier",
        ));
    }
    let digits = match spec.grouping {
        Some(separator) => group_digits(&digits, separator),
        None => digits,
    };
    let prefix = if spec.alternate { prefix } else { "" };
    let sign = format!("{}{prefix}", sign_prefix(value < 0, spec));
    Ok(pad(&digits, &sign, spec, true))
}

/// Applies a format spec the way Python's `format(value, spec)` does.
pub(crate) fn format_value(value: &Value, spec: &str) -> ExecResult<String> {
    if spec.is_empty() {
        return Ok(value.to_str());
    }
    let parsed = parse_spec(spec)?;
    match value {
        Value::Int(i) => format_int(*i, &parsed),
        Value::Bool(b) if parsed.kind.is_some() => format_int(i64::from(*b), &parsed),
        Value::Float(f) => format_float(*f, &parsed),
        Value::Str(s) => {
            if !matches!(parsed.kind, None | Some('s')) {
                return Err(Exception::value_error(format!(
                    "Unknown format code '{}' for object of type 'str'",
                    parsed.kind.unwrap_or('s')
                )));
            }
            if parsed.sign.is_some() {
                return Err(Exception::value_error("Sign not allowed in string format specifier"));
            }
            let text: String = match parsed.precision {
                Some(precision) => s.chars().take(precision).collect(),
                None => s.clone(),
            };
            Ok(pad(&text, "", &parsed, false))
        }
        Value::Bool(_) | Value::None => Ok(pad(&value.to_str(), "", &parsed, false)),
        other => Err(Exception::type_error(format!(
            "unsupported format string passed to {}.__format__",
            other.type_name()
        ))),
    }
}

/// Renders one replacement field: optional `!r`/`!s`/`!a` conversion, then
/// the format spec.
pub(crate) fn render_field(value: &Value, conversion: Option<char>, spec: &str) -> ExecResult<String> {
    match conversion {
        Some('r' | 'a') => format_value(&Value::Str(value.repr()), spec),
        Some(_) => format_value(&Value::Str(value.to_str()), spec),
        None => format_value(value, spec),
    }
}

/// `str.format(*args, **kwargs)`.
pub(crate) fn str_format(template: &str, args: &CallArgs) -> ExecResult<String> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut auto_index = 0usize;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                out.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                out.push('}');
                i += 2;
            }
            '}' => return Err(Exception::value_error("Single '}' encountered in format string")),
            '{' => {
                let close = chars[i..]
                    .iter()
                    .position(|&c| c == '}')
                    .map(|offset| i + offset)
                    .ok_or_else(|| {
                        Exception::value_error("Single '{' encountered in format string")
                    })?;
                let field: String = chars[i + 1..close].iter().collect();
                let (head, spec) = field.split_once(':').unwrap_or((&field, ""));
                let (name, conversion) = match head.split_once('!') {
                    Some((name, conv)) => (name, conv.chars().next()),
                    None => (head, None),
                };

                let value = if name.is_empty() {
                    let value = args.positional.get(auto_index).cloned();
                    auto_index += 1;
                    value.ok_or_else(|| {
                        Exception::new(
                            ExceptionKind::IndexError,
                            format!("Replacement index {} out of range for positional args tuple", auto_index - 1),
                        )
                    })?
                } else if let Ok(index) = name.parse::<usize>() {
                    args.positional.get(index).cloned().ok_or_else(|| {
                        Exception::new(
                            ExceptionKind::IndexError,
                            format!("Replacement index {index} out of range for positional args tuple"),
                        )
                    })?
                } else {
                    args.keywords.get(name).cloned().ok_or_else(|| {
                        Exception::new(ExceptionKind::KeyError, format!("'{name}'"))
                    })?
                };
                out.push_str(&render_field(&value, conversion, spec)?);
                i = close + 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// printf-style `template % values`.
pub(crate) fn percent_format(template: &str, values: &Value) -> ExecResult<String> {
    let args = match values {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut next = args.iter();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while chars
            .get(i)
            .is_some_and(|c| matches!(c, '-' | '+' | ' ' | '#' | '0'..='9' | '.'))
        {
            i += 1;
        }
        let flags: String = chars[start..i].iter().collect();
        let Some(&conversion) = chars.get(i) else {
            return Err(Exception::value_error("incomplete format"));
        };
        i += 1;
        if conversion == '%' {
            out.push('%');
            continue;
        }
        let value = next.next().ok_or_else(|| {
            Exception::type_error("not enough arguments for format string")
        })?;
        let spec = flags.replacen('-', "<", 1);
        let rendered = match conversion {
            's' => format_value(&Value::Str(value.to_str()), &spec)?,
            'r' | 'a' => format_value(&Value::Str(value.repr()), &spec)?,
            'd' | 'i' | 'u' => {
                let int = match value {
                    #[allow(clippy::cast_possible_truncation)]
                    Value::Float(f) => Value::Int(f.trunc() as i64),
                    other => other.clone(),
                };
                if int.as_int().is_none() {
                    return Err(Exception::type_error(format!(
                        "%{conversion} format: a real number is required, not {}",
                        value.type_name()
                    )));
                }
                format_value(&int, &spec)?
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'x' | 'X' | 'o' => {
                format_value(value, &format!("{spec}{conversion}"))?
            }
            other => {
                return Err(Exception::value_error(format!(
                    "unsupported format character '{other}'"
                )));
            }
        };
        out.push_str(&rendered);
    }
    if next.next().is_some() {
        return Err(Exception::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_repr_matches_python() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(-2.5), "-2.5");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(123_456_789.0), "123456789.0");
        assert_eq!(float_repr(0.0001), "0.0001");
        assert_eq!(float_repr(0.00001), "1e-05");
        assert_eq!(float_repr(1.5e-7), "1.5e-07");
        assert_eq!(float_repr(f64::INFINITY), "inf");
    }

    #[test]
    fn format_specs() {
        assert_eq!(format_value(&Value::Float(3.14159), ".2f").unwrap(), "3.14");
        assert_eq!(format_value(&Value::Int(42), ">5").unwrap(), "   42");
        assert_eq!(format_value(&Value::Int(42), "05d").unwrap(), "00042");
        assert_eq!(format_value(&Value::Int(1_234_567), ",").unwrap(), "1,234,567");
        assert_eq!(format_value(&Value::Int(255), "#x").unwrap(), "0xff");
        assert_eq!(format_value(&Value::str("ab"), "*^6").unwrap(), "**ab**");
        assert_eq!(format_value(&Value::Float(0.25), ".0%").unwrap(), "25%");
        assert_eq!(format_value(&Value::Float(1234.5), ".3e").unwrap(), "1.234e+03");
        assert_eq!(format_value(&Value::Float(0.000_012_5), "g").unwrap(), "1.25e-05");
        assert_eq!(format_value(&Value::Float(2.0), "g").unwrap(), "2");
        assert_eq!(format_value(&Value::Float(-1.5), "+.1f").unwrap(), "-1.5");
        assert_eq!(format_value(&Value::Int(-7), "+d").unwrap(), "-7");
        assert!(format_value(&Value::str("x"), "d").is_err());
    }

    #[test]
    fn str_format_fields() {
        let mut args = CallArgs::positional(vec![Value::str("a"), Value::Int(2)]);
        args.keywords.insert("name".into(), Value::str("bob"));
        assert_eq!(str_format("{} {} {name!r} {{}}", &args).unwrap(), "a 2 'bob' {}");
        assert_eq!(str_format("{1}{0}", &args).unwrap(), "2a");
        assert!(str_format("{missing}", &args).is_err());
    }

    #[test]
    fn percent_interpolation() {
        let values = Value::tuple(vec![Value::str("x"), Value::Float(1.5), Value::Int(3)]);
        assert_eq!(
            percent_format("%s=%.2f (%d%%)", &values).unwrap(),
            "x=1.50 (3%)"
        );
        assert!(percent_format("%s %s", &Value::Int(1)).is_err());
    }
}

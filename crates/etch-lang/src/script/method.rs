//! Methods on primitive values that need no callbacks.
use smol_str::SmolStr;

use super::{
    builtin::number_to_radix,
    error::EvalError,
    value::{MAX_STRING_LENGTH, Value, number_to_string},
};

pub fn invalid_string_length() -> EvalError {
    EvalError::Range("Invalid string length".to_string())
}

/// Calls `name` on a string. `None` when the method does not exist.
pub fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
    let chars = || s.chars().collect::<Vec<_>>();

    let value = match name {
        "toUpperCase" => Value::string(s.to_uppercase()),
        "toLowerCase" => Value::string(s.to_lowercase()),
        "trim" => Value::string(s.trim()),
        "trimStart" => Value::string(s.trim_start()),
        "trimEnd" => Value::string(s.trim_end()),
        "toString" | "valueOf" => Value::string(s),
        "split" => {
            let parts = match args.first() {
                None | Some(Value::Undefined) => vec![Value::string(s)],
                Some(separator) => {
                    let separator = separator.to_string();
                    if separator.is_empty() {
                        s.chars().map(|c| Value::string(c.to_string())).collect()
                    } else {
                        s.split(separator.as_str()).map(Value::string).collect()
                    }
                }
            };
            let limit = match args.get(1) {
                None | Some(Value::Undefined) => usize::MAX,
                Some(limit) => limit.to_number().max(0.0) as usize,
            };
            Value::array(parts.into_iter().take(limit).collect())
        }
        "replace" => Value::string(s.replacen(
            string_arg(args, 0).as_str(),
            string_arg(args, 1).as_str(),
            1,
        )),
        "replaceAll" => {
            Value::string(s.replace(string_arg(args, 0).as_str(), string_arg(args, 1).as_str()))
        }
        "startsWith" => Value::Bool(s.starts_with(string_arg(args, 0).as_str())),
        "endsWith" => Value::Bool(s.ends_with(string_arg(args, 0).as_str())),
        "includes" => Value::Bool(s.contains(string_arg(args, 0).as_str())),
        "indexOf" => Value::Number(
            s.find(string_arg(args, 0).as_str())
                .map_or(-1.0, |i| s[..i].chars().count() as f64),
        ),
        "lastIndexOf" => Value::Number(
            s.rfind(string_arg(args, 0).as_str())
                .map_or(-1.0, |i| s[..i].chars().count() as f64),
        ),
        "slice" => {
            let chars = chars();
            let start = relative_index(args.first(), chars.len(), 0);
            let end = relative_index(args.get(1), chars.len(), chars.len());
            Value::string(chars[start..end.max(start)].iter().collect::<String>())
        }
        "substring" => {
            let chars = chars();
            let clamp = |value: Option<&Value>, default: usize| match value {
                None | Some(Value::Undefined) => default,
                Some(value) => {
                    let n = value.to_number();
                    if n.is_nan() { 0 } else { n.clamp(0.0, chars.len() as f64) as usize }
                }
            };
            let (a, b) = (clamp(args.first(), 0), clamp(args.get(1), chars.len()));
            let (start, end) = if a > b { (b, a) } else { (a, b) };
            Value::string(chars[start..end].iter().collect::<String>())
        }
        "padStart" | "padEnd" => {
            let target = args.first().map_or(0.0, Value::to_number).max(0.0) as usize;
            let filler = match args.get(1) {
                None | Some(Value::Undefined) => " ".to_string(),
                Some(filler) => filler.to_string(),
            };
            let length = s.chars().count();
            if target <= length || filler.is_empty() {
                Value::string(s)
            } else if target > MAX_STRING_LENGTH {
                return Err(invalid_string_length());
            } else {
                let padding = filler
                    .chars()
                    .cycle()
                    .take(target - length)
                    .collect::<String>();
                if name == "padStart" {
                    Value::string(format!("{padding}{s}"))
                } else {
                    Value::string(format!("{s}{padding}"))
                }
            }
        }
        "repeat" => {
            let count = args.first().map_or(0.0, Value::to_number);
            if count < 0.0 || count.is_infinite() {
                return Err(EvalError::Range(format!(
                    "Invalid count value: {}",
                    number_to_string(count)
                )));
            }
            if s.len() as f64 * count.trunc() > MAX_STRING_LENGTH as f64 {
                return Err(invalid_string_length());
            }
            Value::string(s.repeat(count as usize))
        }
        "charAt" => {
            let index = args.first().map_or(0.0, Value::to_number);
            Value::string(
                (index >= 0.0)
                    .then(|| s.chars().nth(index as usize))
                    .flatten()
                    .map(String::from)
                    .unwrap_or_default(),
            )
        }
        "charCodeAt" => {
            let index = args.first().map_or(0.0, Value::to_number);
            Value::Number(
                (index >= 0.0)
                    .then(|| s.encode_utf16().nth(index as usize))
                    .flatten()
                    .map_or(f64::NAN, f64::from),
            )
        }
        "at" => {
            let chars = chars();
            at(chars.as_slice(), args.first())
                .map(|c| Value::string(c.to_string()))
                .unwrap_or_default()
        }
        "concat" => Value::string(
            std::iter::once(s.to_string())
                .chain(args.iter().map(Value::to_string))
                .collect::<String>(),
        ),
        _ => return Ok(None),
    };

    Ok(Some(value))
}

/// Calls `name` on a number. `None` when the method does not exist.
pub fn number_method(n: f64, name: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
    let value = match name {
        "toFixed" => {
            let digits = args.first().map_or(0.0, Value::to_number);
            if !(0.0..=100.0).contains(&digits) {
                return Err(EvalError::Range(
                    "toFixed() digits argument must be between 0 and 100".to_string(),
                ));
            }
            if n.is_finite() {
                Value::string(format!("{:.*}", digits as usize, n))
            } else {
                Value::string(number_to_string(n))
            }
        }
        "toString" => {
            let radix = match args.first() {
                None | Some(Value::Undefined) => 10.0,
                Some(radix) => radix.to_number(),
            };
            if !(2.0..=36.0).contains(&radix) {
                return Err(EvalError::Range(
                    "toString() radix must be between 2 and 36".to_string(),
                ));
            }
            Value::string(number_to_radix(n, radix as u32))
        }
        "valueOf" => Value::Number(n),
        _ => return Ok(None),
    };

    Ok(Some(value))
}

fn string_arg(args: &[Value], index: usize) -> SmolStr {
    match args.get(index) {
        Some(value) => SmolStr::new(value.to_string()),
        None => SmolStr::new_static("undefined"),
    }
}

/// Resolves a possibly negative `slice`-style index against `len`.
pub fn relative_index(value: Option<&Value>, len: usize, default: usize) -> usize {
    let n = match value {
        None | Some(Value::Undefined) => return default,
        Some(value) => value.to_number(),
    };

    if n.is_nan() {
        0
    } else if n < 0.0 {
        (len as f64 + n.trunc()).max(0.0) as usize
    } else {
        n.trunc().min(len as f64) as usize
    }
}

/// The element at a possibly negative index, as `at` reads it.
pub fn at<T: Clone>(items: &[T], index: Option<&Value>) -> Option<T> {
    let n = index.map_or(0.0, Value::to_number).trunc();
    let n = if n.is_nan() { 0.0 } else { n };
    let index = if n < 0.0 { items.len() as f64 + n } else { n };

    (index >= 0.0)
        .then(|| items.get(index as usize).cloned())
        .flatten()
}

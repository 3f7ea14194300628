//! Global functions and objects available to template code.
use std::{
    cell::Cell,
    time::{SystemTime, UNIX_EPOCH},
};

use itertools::Itertools;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use super::{
    env::Env,
    error::EvalError,
    value::{Object, Value, number_to_string},
};

type Builtin = fn(&[Value]) -> Result<Value, EvalError>;

/// Characters left as-is by `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const GLOBAL_FUNCTIONS: &[(&str, Builtin)] = &[
    ("String", |args| Ok(Value::string(arg(args, 0).to_string()))),
    ("Number", |args| {
        Ok(Value::Number(args.first().map_or(0.0, Value::to_number)))
    }),
    ("Boolean", |args| Ok(Value::Bool(arg(args, 0).is_truthy()))),
    ("parseInt", parse_int),
    ("parseFloat", |args| {
        Ok(Value::Number(parse_float(&arg(args, 0).to_string())))
    }),
    ("isNaN", |args| Ok(Value::Bool(arg(args, 0).to_number().is_nan()))),
    ("isFinite", |args| {
        Ok(Value::Bool(arg(args, 0).to_number().is_finite()))
    }),
    ("encodeURIComponent", |args| {
        Ok(Value::string(
            utf8_percent_encode(&arg(args, 0).to_string(), URI_COMPONENT).to_string(),
        ))
    }),
    ("decodeURIComponent", |args| {
        percent_decode_str(&arg(args, 0).to_string())
            .decode_utf8()
            .map(|decoded| Value::string(decoded.into_owned()))
            .map_err(|_| thrown("URIError", "URI malformed"))
    }),
    ("Error", |args| Ok(error_object("Error", args))),
    ("TypeError", |args| Ok(error_object("TypeError", args))),
    ("RangeError", |args| Ok(error_object("RangeError", args))),
];

const MATH_FUNCTIONS: &[(&str, Builtin)] = &[
    ("abs", |args| unary_math(args, f64::abs)),
    ("ceil", |args| unary_math(args, f64::ceil)),
    ("floor", |args| unary_math(args, f64::floor)),
    ("round", |args| unary_math(args, |n| (n + 0.5).floor())),
    ("trunc", |args| unary_math(args, f64::trunc)),
    ("sign", |args| {
        unary_math(args, |n| if n == 0.0 || n.is_nan() { n } else { n.signum() })
    }),
    ("sqrt", |args| unary_math(args, f64::sqrt)),
    ("log", |args| unary_math(args, f64::ln)),
    ("pow", |args| {
        Ok(Value::Number(
            arg(args, 0).to_number().powf(arg(args, 1).to_number()),
        ))
    }),
    ("max", |args| {
        Ok(Value::Number(args.iter().map(Value::to_number).fold(
            f64::NEG_INFINITY,
            |acc, n| if n.is_nan() || acc.is_nan() { f64::NAN } else { acc.max(n) },
        )))
    }),
    ("min", |args| {
        Ok(Value::Number(args.iter().map(Value::to_number).fold(
            f64::INFINITY,
            |acc, n| if n.is_nan() || acc.is_nan() { f64::NAN } else { acc.min(n) },
        )))
    }),
    ("random", |_| Ok(Value::Number(random()))),
];

const OBJECT_FUNCTIONS: &[(&str, Builtin)] = &[
    ("keys", |args| {
        Ok(Value::array(
            arg(args, 0).keys().into_iter().map(Value::String).collect(),
        ))
    }),
    ("values", |args| {
        let target = arg(args, 0);
        Ok(Value::array(
            target
                .keys()
                .iter()
                .map(|key| target.property(key).unwrap_or_default())
                .collect(),
        ))
    }),
    ("entries", |args| {
        let target = arg(args, 0);
        Ok(Value::array(
            target
                .keys()
                .into_iter()
                .map(|key| {
                    let value = target.property(&key).unwrap_or_default();
                    Value::array(vec![Value::String(key), value])
                })
                .collect(),
        ))
    }),
    ("assign", |args| {
        let target = arg(args, 0);
        let Value::Object(object) = &target else {
            return Err(EvalError::type_error(
                "Cannot convert undefined or null to object",
            ));
        };

        for source in args.iter().skip(1) {
            for key in source.keys() {
                let value = source.property(&key).unwrap_or_default();
                object.borrow_mut().set(key, value);
            }
        }

        Ok(target)
    }),
];

const ARRAY_FUNCTIONS: &[(&str, Builtin)] = &[
    ("isArray", |args| {
        Ok(Value::Bool(matches!(args.first(), Some(Value::Array(_)))))
    }),
    ("from", |args| match arg(args, 0) {
        Value::Array(values) => Ok(Value::array(values.borrow().clone())),
        Value::String(s) => Ok(Value::array(
            s.chars().map(|c| Value::string(c.to_string())).collect(),
        )),
        _ => Ok(Value::array(Vec::new())),
    }),
];

const JSON_FUNCTIONS: &[(&str, Builtin)] = &[
    ("stringify", |args| {
        let value = arg(args, 0);
        if matches!(value, Value::Undefined | Value::Function(_)) {
            return Ok(Value::Undefined);
        }

        let json = value.to_json();
        let text = if arg(args, 2).is_truthy() {
            serde_json::to_string_pretty(&json)
        } else {
            serde_json::to_string(&json)
        };

        text.map(Value::from)
            .map_err(|e| EvalError::type_error(e.to_string()))
    }),
    ("parse", |args| {
        serde_json::from_str::<serde_json::Value>(&arg(args, 0).to_string())
            .map(Value::from)
            .map_err(|e| thrown("SyntaxError", &e.to_string()))
    }),
];

const CONSOLE_FUNCTIONS: &[(&str, Builtin)] = &[
    ("log", |args| {
        log::info!(target: "etch::console", "{}", join_args(args));
        Ok(Value::Undefined)
    }),
    ("warn", |args| {
        log::warn!(target: "etch::console", "{}", join_args(args));
        Ok(Value::Undefined)
    }),
    ("error", |args| {
        log::error!(target: "etch::console", "{}", join_args(args));
        Ok(Value::Undefined)
    }),
];

/// Defines every global into `env`.
pub fn install(env: &mut Env) {
    for (name, f) in GLOBAL_FUNCTIONS {
        env.define(*name, Value::function(name, *f));
    }

    let mut math = namespace("Math", MATH_FUNCTIONS);
    math.set("PI", Value::Number(std::f64::consts::PI));
    math.set("E", Value::Number(std::f64::consts::E));

    env.define("Math", Value::object(math));
    env.define("Object", Value::object(namespace("Object", OBJECT_FUNCTIONS)));
    env.define("Array", Value::object(namespace("Array", ARRAY_FUNCTIONS)));
    env.define("JSON", Value::object(namespace("JSON", JSON_FUNCTIONS)));
    env.define("console", Value::object(namespace("console", CONSOLE_FUNCTIONS)));

    env.define_const("undefined", Value::Undefined);
    env.define_const("NaN", Value::Number(f64::NAN));
    env.define_const("Infinity", Value::Number(f64::INFINITY));
}

fn namespace(name: &str, functions: &[(&str, Builtin)]) -> Object {
    let mut object = functions
        .iter()
        .map(|(key, f)| (*key, Value::function(key, *f)))
        .collect::<Object>();
    object.set("name", Value::string(name));
    object
}

#[inline(always)]
fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

#[inline(always)]
fn unary_math(args: &[Value], f: impl Fn(f64) -> f64) -> Result<Value, EvalError> {
    Ok(Value::Number(f(arg(args, 0).to_number())))
}

fn join_args(args: &[Value]) -> String {
    args.iter().map(Value::to_string).join(" ")
}

fn thrown(name: &str, message: &str) -> EvalError {
    EvalError::Thrown {
        name: name.into(),
        message: message.to_string(),
    }
}

/// What `new Error(message)` evaluates to.
pub fn error_object(name: &str, args: &[Value]) -> Value {
    let message = match args.first() {
        None | Some(Value::Undefined) => String::new(),
        Some(message) => message.to_string(),
    };

    Value::object(Object::from_iter([
        ("name", Value::string(name)),
        ("message", Value::from(message)),
    ]))
}

fn parse_int(args: &[Value]) -> Result<Value, EvalError> {
    let text = arg(args, 0).to_string();
    let text = text.trim();
    let (negative, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let mut radix = match args.get(1).map(Value::to_number) {
        Some(radix) if radix.is_finite() && radix != 0.0 => radix as u32,
        _ => 10,
    };
    let text = match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) if radix == 10 || radix == 16 => {
            radix = 16;
            hex
        }
        _ => text,
    };

    if !(2..=36).contains(&radix) {
        return Ok(Value::Number(f64::NAN));
    }

    let digits = text
        .chars()
        .map_while(|c| c.to_digit(radix))
        .collect::<Vec<_>>();
    if digits.is_empty() {
        return Ok(Value::Number(f64::NAN));
    }

    let n = digits
        .into_iter()
        .fold(0.0, |acc, digit| acc * f64::from(radix) + f64::from(digit));
    Ok(Value::Number(if negative { -n } else { n }))
}

/// The longest numeric prefix of `text`, as `parseFloat` reads it.
pub fn parse_float(text: &str) -> f64 {
    let text = text.trim_start();
    if text.starts_with("Infinity") || text.starts_with("+Infinity") {
        return f64::INFINITY;
    }
    if text.starts_with("-Infinity") {
        return f64::NEG_INFINITY;
    }

    let mut end = 0;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let bytes = text.as_bytes();

    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => {}
            b'+' | b'-' if end == 0 || matches!(bytes[end - 1], b'e' | b'E') => {}
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if !seen_exp && end > 0 => seen_exp = true,
            _ => break,
        }
        end += 1;
    }

    // Back off trailing characters that do not complete a number, e.g. `1e`.
    (0..=end)
        .rev()
        .find_map(|i| text[..i].parse::<f64>().ok())
        .unwrap_or(f64::NAN)
}

thread_local! {
    static SEED: Cell<u64> = Cell::new(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x2545_f491_4f6c_dd1d)
            | 1,
    );
}

fn random() -> f64 {
    SEED.with(|seed| {
        let mut x = seed.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        seed.set(x);
        (x >> 11) as f64 / (1u64 << 53) as f64
    })
}

/// `Number.prototype.toString` with a radix.
pub fn number_to_radix(n: f64, radix: u32) -> String {
    if radix == 10 || !n.is_finite() || n.fract() != 0.0 {
        return number_to_string(n);
    }

    let mut digits = Vec::new();
    let mut value = n.abs() as u64;
    loop {
        let digit = (value % u64::from(radix)) as u32;
        digits.push(std::char::from_digit(digit, radix).unwrap_or('0'));
        value /= u64::from(radix);
        if value == 0 {
            break;
        }
    }
    if n < 0.0 {
        digits.push('-');
    }

    digits.into_iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::env::{self, Env};
    use rstest::rstest;
    use serde_json::json;

    fn call(path: &[&str], args: &[Value]) -> Result<Value, EvalError> {
        let root = Env::root();
        install(&mut root.borrow_mut());

        let mut value = env::lookup(&root, path[0]).unwrap();
        for key in &path[1..] {
            value = value.property(key).unwrap();
        }

        match value {
            Value::Function(function) => match function.as_ref() {
                crate::script::value::Function::Native { f, .. } => f(args),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    #[rstest]
    #[case(&["parseInt"], vec![Value::from("42px")], Value::Number(42.0))]
    #[case(&["parseInt"], vec![Value::from("-0x1f")], Value::Number(-31.0))]
    #[case(&["parseInt"], vec![Value::from("101"), Value::from(2.0)], Value::Number(5.0))]
    #[case(&["parseFloat"], vec![Value::from("3.14abc")], Value::Number(3.14))]
    #[case(&["parseFloat"], vec![Value::from("1e3")], Value::Number(1000.0))]
    #[case(&["Math", "max"], vec![Value::from(1.0), Value::from(5.0)], Value::Number(5.0))]
    #[case(&["Math", "round"], vec![Value::from(-2.5)], Value::Number(-2.0))]
    #[case(&["String"], vec![Value::Null], Value::from("null"))]
    #[case(&["Number"], vec![], Value::Number(0.0))]
    #[case(
        &["encodeURIComponent"],
        vec![Value::from("a b&c/d(e)")],
        Value::from("a%20b%26c%2Fd(e)")
    )]
    #[case(&["decodeURIComponent"], vec![Value::from("a%20b")], Value::from("a b"))]
    #[case(&["Array", "isArray"], vec![Value::array(vec![])], Value::Bool(true))]
    fn test_builtin(#[case] path: &[&str], #[case] args: Vec<Value>, #[case] expected: Value) {
        assert_eq!(call(path, &args), Ok(expected));
    }

    #[test]
    fn test_parse_int_nan() {
        let Ok(Value::Number(n)) = call(&["parseInt"], &[Value::from("px")]) else {
            panic!("expected a number");
        };
        assert!(n.is_nan());
    }

    #[test]
    fn test_json() {
        let value = Value::from(json!({"a": [1, 2], "b": "x"}));
        assert_eq!(
            call(&["JSON", "stringify"], &[value]),
            Ok(Value::from(r#"{"a":[1,2],"b":"x"}"#))
        );
        assert_eq!(
            call(&["JSON", "parse"], &[Value::from("[1, true]")]),
            Ok(Value::from(json!([1, true])))
        );
        assert!(matches!(
            call(&["JSON", "parse"], &[Value::from("{")]),
            Err(EvalError::Thrown { name, .. }) if name == "SyntaxError"
        ));
    }

    #[test]
    fn test_object_functions() {
        let value = Value::from(json!({"a": 1, "b": 2}));
        assert_eq!(
            call(&["Object", "keys"], &[value.clone()]),
            Ok(Value::from(json!(["a", "b"])))
        );
        assert_eq!(
            call(&["Object", "entries"], &[value.clone()]),
            Ok(Value::from(json!([["a", 1], ["b", 2]])))
        );

        let target = Value::from(json!({"a": 0}));
        call(&["Object", "assign"], &[target.clone(), value]).unwrap();
        assert_eq!(target.to_json(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_error_object() {
        let error = call(&["Error"], &[Value::from("boom")]).unwrap();
        assert_eq!(error.to_string(), "Error: boom");
    }

    #[rstest]
    #[case(255.0, 16, "ff")]
    #[case(-5.0, 2, "-101")]
    #[case(1.5, 2, "1.5")]
    fn test_number_to_radix(#[case] n: f64, #[case] radix: u32, #[case] expected: &str) {
        assert_eq!(number_to_radix(n, radix), expected);
    }

    #[test]
    fn test_random_in_range() {
        let n = random();
        assert!((0.0..1.0).contains(&n));
    }
}

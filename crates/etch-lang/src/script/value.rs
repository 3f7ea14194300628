use std::{
    cell::RefCell,
    fmt::{self, Debug, Display, Formatter},
    future::Future,
    rc::Rc,
    sync::Arc,
};

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use itertools::Itertools;
use smol_str::SmolStr;

use super::{ast::FunctionDef, env::Env, error::EvalError};

pub type NativeFn = Rc<dyn Fn(&[Value]) -> Result<Value, EvalError>>;

/// A value that resolves later. Cloning shares the underlying computation.
pub type Pending = Shared<LocalBoxFuture<'static, Result<Value, EvalError>>>;

/// Longest string template code may build.
pub const MAX_STRING_LENGTH: usize = (1 << 29) - 24;

/// Longest array template code may grow by assignment. Arrays are dense.
pub const MAX_ARRAY_LENGTH: usize = 1 << 24;

/// Data as seen by template code.
///
/// Arrays and objects are reference types: clones share the same storage,
/// so mutations made by template code are visible through every handle.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(SmolStr),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<Object>>),
    Function(Rc<Function>),
    Pending(Pending),
}

/// Insertion-ordered property map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    entries: Vec<(SmolStr, Value)>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    pub fn set(&mut self, key: impl Into<SmolStr>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &SmolStr> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<SmolStr>> FromIterator<(K, Value)> for Object {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        let mut object = Object::new();
        for (key, value) in iter {
            object.set(key, value);
        }
        object
    }
}

pub struct Closure {
    pub def: Arc<FunctionDef>,
    pub env: Rc<RefCell<Env>>,
}

pub enum Function {
    Closure(Closure),
    Native { name: SmolStr, f: NativeFn },
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Closure(closure) => closure.def.name.as_deref().unwrap_or_default(),
            Function::Native { name, .. } => name,
        }
    }
}

impl Value {
    /// A host function callable from template code.
    pub fn function<F>(name: &str, f: F) -> Value
    where
        F: Fn(&[Value]) -> Result<Value, EvalError> + 'static,
    {
        Value::Function(Rc::new(Function::Native {
            name: name.into(),
            f: Rc::new(f),
        }))
    }

    /// A host function whose result resolves later. Calling it yields a
    /// pending value that an async template awaits or writes to its output.
    pub fn async_function<F>(name: &str, f: F) -> Value
    where
        F: Fn(&[Value]) -> LocalBoxFuture<'static, Result<Value, EvalError>> + 'static,
    {
        Value::function(name, move |args| Ok(Value::Pending(f(args).shared())))
    }

    pub fn pending<F>(future: F) -> Value
    where
        F: Future<Output = Result<Value, EvalError>> + 'static,
    {
        Value::Pending(future.boxed_local().shared())
    }

    pub fn array(values: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(values)))
    }

    pub fn object(object: Object) -> Value {
        Value::Object(Rc::new(RefCell::new(object)))
    }

    pub fn string(value: impl Into<SmolStr>) -> Value {
        Value::String(value.into())
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Pending(_) => true,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) => "function",
            Value::Null | Value::Array(_) | Value::Object(_) | Value::Pending(_) => "object",
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::String(s) => string_to_number(s),
            Value::Array(_) => string_to_number(&self.to_string()),
            Value::Object(_) | Value::Function(_) | Value::Pending(_) => f64::NAN,
        }
    }

    /// Reads a property the way member access does, without consulting
    /// built-in methods.
    pub fn property(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(object) => object.borrow().get(key).cloned(),
            Value::Array(values) => {
                let values = values.borrow();
                if key == "length" {
                    return Some(Value::Number(values.len() as f64));
                }
                key.parse::<usize>()
                    .ok()
                    .and_then(|index| values.get(index).cloned())
            }
            Value::String(s) => {
                if key == "length" {
                    return Some(Value::Number(s.encode_utf16().count() as f64));
                }
                key.parse::<usize>()
                    .ok()
                    .and_then(|index| s.chars().nth(index))
                    .map(|c| Value::string(c.to_string()))
            }
            Value::Function(function) if key == "name" => Some(Value::string(function.name())),
            _ => None,
        }
    }

    /// Enumerable keys, as iterated by `for..in` and `Object.keys`.
    pub fn keys(&self) -> Vec<SmolStr> {
        match self {
            Value::Object(object) => object.borrow().keys().cloned().collect(),
            Value::Array(values) => (0..values.borrow().len())
                .map(|i| SmolStr::new(i.to_string()))
                .collect(),
            Value::String(s) => (0..s.chars().count())
                .map(|i| SmolStr::new(i.to_string()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Shallow copy of an object's properties with `overrides` applied on top.
    pub fn merged_with(&self, overrides: Option<&Value>) -> Value {
        let mut object = match self {
            Value::Object(object) => object.borrow().clone(),
            _ => Object::new(),
        };

        if let Some(Value::Object(overrides)) = overrides {
            for (key, value) in overrides.borrow().iter() {
                object.set(key.clone(), value.clone());
            }
        }

        Value::object(object)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null | Value::Function(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::Array(values) => {
                serde_json::Value::Array(values.borrow().iter().map(Value::to_json).collect())
            }
            Value::Object(object) => serde_json::Value::Object(
                object
                    .borrow()
                    .iter()
                    .filter(|(_, value)| !matches!(value, Value::Undefined | Value::Function(_)))
                    .map(|(key, value)| (key.to_string(), value.to_json()))
                    .collect(),
            ),
            Value::Pending(_) => serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Formats a number the way template code prints it: whole numbers without
/// a fractional part.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.abs() >= 1e21 || n.abs() < 1e-6 {
        let formatted = format!("{n:e}");
        match formatted.split_once('e') {
            Some((mantissa, exponent)) if !exponent.starts_with('-') => {
                format!("{mantissa}e+{exponent}")
            }
            _ => formatted,
        }
    } else if n.fract() == 0.0 {
        format!("{n:.0}")
    } else {
        format!("{n}")
    }
}

/// Awaits a pending value, following pending values it resolves to.
pub async fn settle(mut pending: Pending) -> Result<Value, EvalError> {
    loop {
        match pending.await? {
            Value::Pending(next) => pending = next,
            value => return Ok(value),
        }
    }
}

pub fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();

    match trimmed {
        "" => return 0.0,
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }

    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return i64::from_str_radix(hex, 16)
            .map(|n| n as f64)
            .unwrap_or(f64::NAN);
    }

    if trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        trimmed.parse().unwrap_or(f64::NAN)
    } else {
        f64::NAN
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", number_to_string(*n)),
            Value::String(s) => write!(f, "{s}"),
            Value::Array(values) => write!(
                f,
                "{}",
                values
                    .borrow()
                    .iter()
                    .map(|value| match value {
                        Value::Undefined | Value::Null => String::new(),
                        value => value.to_string(),
                    })
                    .join(",")
            ),
            Value::Object(object) => {
                let object = object.borrow();
                match (object.get("name"), object.get("message")) {
                    (Some(Value::String(name)), Some(message)) if name.ends_with("Error") => {
                        write!(f, "{name}: {message}")
                    }
                    _ => write!(f, "[object Object]"),
                }
            }
            Value::Function(function) => write!(f, "function {}() {{ [code] }}", function.name()),
            Value::Pending(_) => write!(f, "[object Promise]"),
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Array(values) => f.debug_list().entries(values.borrow().iter()).finish(),
            Value::Object(object) => f
                .debug_map()
                .entries(object.borrow().iter())
                .finish(),
            Value::Function(function) => write!(f, "Function({})", function.name()),
            Value::Pending(_) => write!(f, "Pending"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.into()),
            serde_json::Value::Array(values) => {
                Value::array(values.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::array(values)
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Value::object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(1.0, "1")]
    #[case(-3.0, "-3")]
    #[case(0.5, "0.5")]
    #[case(-0.0, "0")]
    #[case(0.1 + 0.2, "0.30000000000000004")]
    #[case(f64::NAN, "NaN")]
    #[case(f64::NEG_INFINITY, "-Infinity")]
    #[case(1e20, "100000000000000000000")]
    #[case(1e21, "1e+21")]
    #[case(-1.5e25, "-1.5e+25")]
    #[case(1.5e-7, "1.5e-7")]
    #[case(0.000001, "0.000001")]
    fn test_number_to_string(#[case] n: f64, #[case] expected: &str) {
        assert_eq!(number_to_string(n), expected);
    }

    #[rstest]
    #[case("42", 42.0)]
    #[case("  1.5 ", 1.5)]
    #[case("", 0.0)]
    #[case("0x10", 16.0)]
    #[case("1e2", 100.0)]
    fn test_string_to_number(#[case] s: &str, #[case] expected: f64) {
        assert_eq!(string_to_number(s), expected);
    }

    #[rstest]
    #[case("abc")]
    #[case("inf")]
    #[case("1px")]
    fn test_string_to_number_nan(#[case] s: &str) {
        assert!(string_to_number(s).is_nan());
    }

    #[rstest]
    #[case(json!(null), "null")]
    #[case(json!(true), "true")]
    #[case(json!(3), "3")]
    #[case(json!("x"), "x")]
    #[case(json!([1, null, "a"]), "1,,a")]
    #[case(json!({"a": 1}), "[object Object]")]
    fn test_display(#[case] value: serde_json::Value, #[case] expected: &str) {
        assert_eq!(Value::from(value).to_string(), expected);
    }

    #[rstest]
    #[case(Value::Undefined, false)]
    #[case(Value::Number(0.0), false)]
    #[case(Value::Number(f64::NAN), false)]
    #[case(Value::from(""), false)]
    #[case(Value::from("0"), true)]
    #[case(Value::array(vec![]), true)]
    fn test_is_truthy(#[case] value: Value, #[case] expected: bool) {
        assert_eq!(value.is_truthy(), expected);
    }

    #[test]
    fn test_property() {
        let value = Value::from(json!({"items": [1, 2], "name": "héllo"}));
        let items = value.property("items").unwrap();

        assert_eq!(items.property("length"), Some(Value::Number(2.0)));
        assert_eq!(items.property("1"), Some(Value::Number(2.0)));
        assert_eq!(value.property("missing"), None);
        assert_eq!(
            value.property("name").and_then(|name| name.property("1")),
            Some(Value::from("é"))
        );
    }

    #[test]
    fn test_merged_with_is_shallow_copy() {
        let parent = Value::from(json!({"a": 1, "b": 2}));
        let merged = parent.merged_with(Some(&Value::from(json!({"b": 3, "c": 4}))));

        assert_eq!(merged.to_json(), json!({"a": 1, "b": 3, "c": 4}));
        assert_eq!(parent.to_json(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_to_json_skips_undefined_members() {
        let object = Object::from_iter([
            ("a", Value::Undefined),
            ("b", Value::Number(1.5)),
            ("f", Value::function("f", |_| Ok(Value::Undefined))),
        ]);
        assert_eq!(Value::object(object).to_json(), json!({"b": 1.5}));
    }
}

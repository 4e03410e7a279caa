//! Dynamic value model.
//!
//! Every expression evaluates to a [`Value`]. Nulls carry a [`ValueKind`] so
//! a null list stays distinguishable from a null string after decoding.

use indexmap::IndexMap;
use std::fmt;

/// The dynamic type of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Any,
    Bool,
    Number,
    String,
    List,
    Set,
    Map,
    Object,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Any => "any",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::List => "list",
            ValueKind::Set => "set",
            ValueKind::Map => "map",
            ValueKind::Object => "object",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numbers are either exact integers or floats; arithmetic stays integral
/// until a float enters the computation.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(i) => *i as f64,
            Number::Float(f) => *f,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Number::Int(i) => Some(*i),
            Number::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Number::Float(_) => None,
        }
    }

    /// Collapse a float that is exactly integral back to an integer.
    pub fn normalized(self) -> Number {
        match self {
            Number::Float(f) if f.fract() == 0.0 && f.is_finite() && f.abs() < i64::MAX as f64 => {
                Number::Int(f as i64)
            }
            n => n,
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            _ => self.as_f64() == other.as_f64(),
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.partial_cmp(b),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{}", i),
            Number::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Number {
    fn from(i: i64) -> Self {
        Number::Int(i)
    }
}

impl From<f64> for Number {
    fn from(f: f64) -> Self {
        Number::Float(f).normalized()
    }
}

/// A dynamically typed pipeline value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A typed null sentinel.
    Null(ValueKind),
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<Value>),
    /// Sets keep insertion order but never hold duplicate elements.
    Set(Vec<Value>),
    Map(IndexMap<String, Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    pub const NULL: Value = Value::Null(ValueKind::Any);

    pub fn null() -> Value {
        Value::NULL
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null(k) => *k,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::List(_) => ValueKind::List,
            Value::Set(_) => ValueKind::Set,
            Value::Map(_) => ValueKind::Map,
            Value::Object(_) => ValueKind::Object,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_number().and_then(|n| n.as_i64())
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_number().map(|n| n.as_f64())
    }

    /// Element sequence of a list or set.
    pub fn as_slice(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) | Value::Set(v) => Some(v),
            _ => None,
        }
    }

    /// Key/value entries of a map or object.
    pub fn as_entries(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(m) | Value::Object(m) => Some(m),
            _ => None,
        }
    }

    /// Whether `for_each` / for-expressions may iterate this value.
    pub fn can_iterate(&self) -> bool {
        matches!(
            self,
            Value::List(_) | Value::Set(_) | Value::Map(_) | Value::Object(_)
        )
    }

    pub fn length(&self) -> Option<usize> {
        match self {
            Value::String(s) => Some(s.chars().count()),
            Value::List(v) | Value::Set(v) => Some(v.len()),
            Value::Map(m) | Value::Object(m) => Some(m.len()),
            _ => None,
        }
    }

    /// Render the value the way it appears inside a template: strings bare,
    /// everything else JSON-shaped.
    pub fn render(&self) -> String {
        match self {
            Value::Null(_) => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Explicit string coercion (`tostring`).
    pub fn coerce_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Explicit number coercion (`tonumber`).
    pub fn coerce_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    Some(Number::Int(i))
                } else {
                    s.trim().parse::<f64>().ok().map(|f| Number::Float(f).normalized())
                }
            }
            _ => None,
        }
    }

    /// Explicit bool coercion (`tobool`).
    pub fn coerce_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn from_json(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::NULL,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Number(Number::Int(i))
                } else {
                    Value::Number(Number::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(Number::Int(i)) => serde_json::Value::from(*i),
            Value::Number(Number::Float(f)) => {
                serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(v) | Value::Set(v) => {
                serde_json::Value::Array(v.iter().map(Value::to_json).collect())
            }
            Value::Map(m) | Value::Object(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Build a set, dropping duplicates while keeping first-seen order.
    pub fn set_of(items: Vec<Value>) -> Value {
        let mut out: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            if !out.contains(&item) {
                out.push(item);
            }
        }
        Value::Set(out)
    }

    pub fn object_of<I: IntoIterator<Item = (String, Value)>>(entries: I) -> Value {
        Value::Object(entries.into_iter().collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null(_) => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => f.write_str(s),
            other => f.write_str(
                &serde_json::to_string(&other.to_json()).unwrap_or_else(|_| String::from("null")),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Number(Number::Int(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Number(Number::from(f))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_null_keeps_kind() {
        let v = Value::Null(ValueKind::List);
        assert!(v.is_null());
        assert_eq!(v.kind(), ValueKind::List);
        assert_ne!(v.kind(), Value::NULL.kind());
    }

    #[test]
    fn test_number_int_float_equality() {
        assert_eq!(Number::Int(3), Number::Float(3.0));
        assert_ne!(Number::Int(3), Number::Float(3.5));
        assert_eq!(Number::from(4.0), Number::Int(4));
    }

    #[test]
    fn test_coerce_number_from_string() {
        assert_eq!(Value::from("42").coerce_number(), Some(Number::Int(42)));
        assert_eq!(Value::from("4.5").coerce_number(), Some(Number::Float(4.5)));
        assert_eq!(Value::from("nope").coerce_number(), None);
    }

    #[test]
    fn test_render_string_is_bare() {
        assert_eq!(Value::from("hi").render(), "hi");
        assert_eq!(Value::List(vec![Value::from(1), Value::from(2)]).render(), "[1,2]");
    }

    #[test]
    fn test_set_drops_duplicates() {
        let s = Value::set_of(vec![Value::from(1), Value::from(2), Value::from(1)]);
        assert_eq!(s.as_slice().unwrap().len(), 2);
    }

    #[test]
    fn test_json_roundtrip() {
        let v = Value::object_of(vec![
            ("a".to_string(), Value::from(1)),
            ("b".to_string(), Value::List(vec![Value::from("x")])),
        ]);
        let back = Value::from_json(v.to_json());
        assert_eq!(back.as_entries().unwrap()["a"], Value::from(1));
    }
}

//! Runtime value representation for pipeline records.
//!
//! A [`Value`] is the typed scalar held in every record field: null, boolean,
//! integer, float, string, or timestamp. Timestamps are stored as nanoseconds
//! since the Unix epoch (UTC) so they stay `Copy`-cheap and totally ordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A dynamically typed scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// Absent or unparseable value.
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Nanoseconds since the Unix epoch, UTC.
    Timestamp(i64),
}

impl Value {
    /// Build a timestamp value from a chrono datetime.
    pub fn timestamp(dt: DateTime<Utc>) -> Self {
        Value::Timestamp(dt.timestamp_nanos_opt().unwrap_or(i64::MAX))
    }

    /// True if this value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Human-readable type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Timestamp(_) => "timestamp",
        }
    }

    /// Boolean accessor.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer accessor. Floats are truncated.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    /// Float accessor. Integers widen losslessly enough for this data.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// String accessor.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Timestamp accessor, as a chrono datetime.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ns) => Some(DateTime::from_timestamp_nanos(*ns)),
            _ => None,
        }
    }

    /// Raw nanosecond accessor for timestamps.
    pub fn as_timestamp_nanos(&self) -> Option<i64> {
        match self {
            Value::Timestamp(ns) => Some(*ns),
            _ => None,
        }
    }

    /// Compare two values of compatible types.
    ///
    /// Numeric values cross-compare (int vs float), strings compare
    /// lexicographically, timestamps chronologically. Mixed or null operands
    /// return `None`; callers treat that as a type error, not an ordering.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Timestamp(ns) => {
                write!(f, "{}", DateTime::<Utc>::from_timestamp_nanos(*ns).to_rfc3339())
            }
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
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::timestamp(dt)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // =========================================================================
    // Accessors
    // =========================================================================

    #[test]
    fn test_accessors_match_variant() {
        assert_eq!(Value::Int(7).as_int(), Some(7));
        assert_eq!(Value::Float(2.5).as_float(), Some(2.5));
        assert_eq!(Value::Str("uk".into()).as_str(), Some("uk"));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert!(Value::Null.as_int().is_none());
        assert!(Value::Str("7".into()).as_int().is_none());
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Value::Int(3).as_float(), Some(3.0));
        assert_eq!(Value::Float(3.9).as_int(), Some(3));
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let dt = Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap();
        let v = Value::timestamp(dt);
        assert_eq!(v.as_timestamp(), Some(dt));
        assert_eq!(v.as_timestamp_nanos(), dt.timestamp_nanos_opt());
    }

    // =========================================================================
    // Comparison
    // =========================================================================

    #[test]
    fn test_compare_same_type() {
        assert_eq!(Value::Int(1).compare(&Value::Int(2)), Some(Ordering::Less));
        assert_eq!(
            Value::Str("a".into()).compare(&Value::Str("b".into())),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Timestamp(10).compare(&Value::Timestamp(10)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_compare_cross_numeric() {
        assert_eq!(Value::Int(2).compare(&Value::Float(1.5)), Some(Ordering::Greater));
        assert_eq!(Value::Float(1.5).compare(&Value::Int(2)), Some(Ordering::Less));
    }

    #[test]
    fn test_compare_incompatible_is_none() {
        assert_eq!(Value::Str("5".into()).compare(&Value::Int(5)), None);
        assert_eq!(Value::Null.compare(&Value::Int(5)), None);
        assert_eq!(Value::Timestamp(1).compare(&Value::Int(1)), None);
    }

    #[test]
    fn test_compare_nan_is_none() {
        assert_eq!(Value::Float(f64::NAN).compare(&Value::Float(1.0)), None);
    }

    // =========================================================================
    // Conversions and display
    // =========================================================================

    #[test]
    fn test_from_impls() {
        assert_eq!(Value::from(5i64), Value::Int(5));
        assert_eq!(Value::from(5i32), Value::Int(5));
        assert_eq!(Value::from(0.5), Value::Float(0.5));
        assert_eq!(Value::from("x"), Value::Str("x".into()));
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(3i64)), Value::Int(3));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Str("GB".into()).to_string(), "GB");
    }

    #[test]
    fn test_default_is_null() {
        assert_eq!(Value::default(), Value::Null);
    }

    #[test]
    fn test_serde_untagged() {
        let v: Value = serde_json::from_str("42").unwrap();
        assert_eq!(v, Value::Int(42));
        let v: Value = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(v, Value::Str("abc".into()));
        let v: Value = serde_json::from_str("null").unwrap();
        assert_eq!(v, Value::Null);
    }
}

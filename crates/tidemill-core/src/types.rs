//! Declared field types and record schemas.
//!
//! A [`Schema`] describes the raw rows a source is expected to produce: an
//! ordered list of named, typed, optionally nullable fields. The connector
//! validates and coerces incoming rows against it; constraint definitions are
//! checked against it before the pipeline starts.

use crate::value::Value;
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// 64-bit signed integer
    Int,
    /// 64-bit floating point
    Float,
    /// Boolean
    Bool,
    /// UTF-8 string
    Str,
    /// Timestamp (nanoseconds since epoch)
    Timestamp,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float)
    }

    /// Coerce a raw textual cell into a [`Value`] of this type.
    ///
    /// Coercion is total: an empty cell or an unparseable one yields
    /// `Value::Null` so the row keeps flowing and the constraint gate decides
    /// its fate. Row-level problems never abort ingestion.
    pub fn coerce(&self, raw: &str) -> Value {
        let raw = raw.trim();
        if raw.is_empty() {
            return Value::Null;
        }
        match self {
            FieldType::Str => Value::Str(raw.to_string()),
            FieldType::Int => raw.parse::<i64>().map(Value::Int).unwrap_or(Value::Null),
            FieldType::Float => raw.parse::<f64>().map(Value::Float).unwrap_or(Value::Null),
            FieldType::Bool => match raw {
                "true" | "True" | "TRUE" | "1" => Value::Bool(true),
                "false" | "False" | "FALSE" | "0" => Value::Bool(false),
                _ => Value::Null,
            },
            FieldType::Timestamp => parse_timestamp(raw).map(Value::Timestamp).unwrap_or(Value::Null),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Int => write!(f, "int"),
            FieldType::Float => write!(f, "float"),
            FieldType::Bool => write!(f, "bool"),
            FieldType::Str => write!(f, "str"),
            FieldType::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// Accepted textual timestamp layouts, tried in order.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Parse a textual timestamp into epoch nanoseconds (UTC).
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc).timestamp_nanos_opt();
    }
    for fmt in TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Utc.from_utc_datetime(&naive).timestamp_nanos_opt();
        }
    }
    // Bare dates land at midnight
    for fmt in &["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            let naive = date.and_hms_opt(0, 0, 0)?;
            return Utc.from_utc_datetime(&naive).timestamp_nanos_opt();
        }
    }
    None
}

/// A single named field in a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    /// Nullable fields may legitimately be missing; non-nullable fields are
    /// still coerced to Null on bad input and left for constraints to catch.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Field {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }
}

/// An ordered list of declared fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

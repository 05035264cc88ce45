//! Stateless row operations.
//!
//! A stage's transform is an ordered list of [`RowOp`]s applied to each
//! record. Every op is total: a failed parse or a missing input writes
//! `Value::Null` into the target field instead of erroring, leaving the
//! constraint gate to decide whether the row survives.

use crate::record::Record;
use serde::{Deserialize, Serialize};
use tidemill_core::{parse_timestamp, Field, FieldType, Schema, Value};

/// Arithmetic for [`RowOp::Compute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
}

/// One row-level transform step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RowOp {
    /// Trim surrounding whitespace on a string field.
    Trim { field: String },
    /// Cast a field to integer (null on failure).
    ToInt { field: String },
    /// Cast a field to float (null on failure).
    ToFloat { field: String },
    /// Rename a field, preserving its position.
    Rename { from: String, to: String },
    /// Remove a field.
    DropField { field: String },
    /// Combine a date field and an optional time field into a timestamp.
    ParseTimestamp {
        date_field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_field: Option<String>,
        target: String,
    },
    /// Derive `target` from two numeric fields.
    Compute {
        target: String,
        left: String,
        arith: ArithOp,
        right: String,
    },
}

impl RowOp {
    /// Apply this op to a record, producing the transformed record.
    pub fn apply(&self, mut record: Record) -> Record {
        match self {
            RowOp::Trim { field } => {
                if let Some(Value::Str(s)) = record.get(field) {
                    let trimmed = s.trim();
                    let value = if trimmed.is_empty() {
                        Value::Null
                    } else {
                        Value::Str(trimmed.to_string())
                    };
                    record.set(field.clone(), value);
                }
                record
            }
            RowOp::ToInt { field } => {
                let value = match record.get(field) {
                    Some(Value::Int(i)) => Value::Int(*i),
                    Some(Value::Float(f)) => Value::Int(*f as i64),
                    Some(Value::Str(s)) => {
                        s.trim().parse::<i64>().map(Value::Int).unwrap_or(Value::Null)
                    }
                    _ => Value::Null,
                };
                record.set(field.clone(), value);
                record
            }
            RowOp::ToFloat { field } => {
                let value = match record.get(field) {
                    Some(Value::Float(f)) => Value::Float(*f),
                    Some(Value::Int(i)) => Value::Float(*i as f64),
                    Some(Value::Str(s)) => {
                        s.trim().parse::<f64>().map(Value::Float).unwrap_or(Value::Null)
                    }
                    _ => Value::Null,
                };
                record.set(field.clone(), value);
                record
            }
            RowOp::Rename { from, to } => {
                if from == to || !record.fields.contains_key(from) {
                    return record;
                }
                record.fields.shift_remove(to);
                if let Some(idx) = record.fields.get_index_of(from) {
                    if let Some((_, value)) = record.fields.swap_remove_index(idx) {
                        record.fields.insert(to.clone(), value);
                        // swap_remove moved the tail entry into `idx`; put the
                        // renamed field back where the original sat
                        let last = record.fields.len() - 1;
                        record.fields.move_index(last, idx);
                    }
                }
                record
            }
            RowOp::DropField { field } => {
                record.fields.shift_remove(field);
                record
            }
            RowOp::ParseTimestamp {
                date_field,
                time_field,
                target,
            } => {
                let date = record.get_str(date_field);
                let time = time_field.as_deref().and_then(|f| record.get_str(f));
                let parsed = match (date, time) {
                    (Some(d), Some(t)) => parse_timestamp(&format!("{d} {t}")),
                    (Some(d), None) => parse_timestamp(d),
                    _ => None,
                };
                record.set(
                    target.clone(),
                    parsed.map(Value::Timestamp).unwrap_or(Value::Null),
                );
                record
            }
            RowOp::Compute {
                target,
                left,
                arith,
                right,
            } => {
                let value = match (record.get(left), record.get(right)) {
                    (Some(Value::Int(a)), Some(Value::Int(b))) => match arith {
                        ArithOp::Add => Value::Int(a + b),
                        ArithOp::Sub => Value::Int(a - b),
                        ArithOp::Mul => Value::Int(a * b),
                    },
                    (Some(l), Some(r)) => match (l.as_float(), r.as_float()) {
                        (Some(a), Some(b)) => match arith {
                            ArithOp::Add => Value::Float(a + b),
                            ArithOp::Sub => Value::Float(a - b),
                            ArithOp::Mul => Value::Float(a * b),
                        },
                        _ => Value::Null,
                    },
                    _ => Value::Null,
                };
                record.set(target.clone(), value);
                record
            }
        }
    }
}

/// Run an op list over one record in order.
pub fn apply_ops(ops: &[RowOp], mut record: Record) -> Record {
    for op in ops {
        record = op.apply(record);
    }
    record
}

/// Derive the schema an op list produces from its input schema.
///
/// Mirrors [`RowOp::apply`] at the type level: casts retype in place,
/// derived targets append or retype, renames keep position. The graph uses
/// this to validate constraints and views before any row is processed.
pub fn output_schema(input: &Schema, ops: &[RowOp]) -> Schema {
    let mut fields: Vec<Field> = input.fields.clone();

    fn upsert(fields: &mut Vec<Field>, name: &str, ty: FieldType) {
        match fields.iter_mut().find(|f| f.name == name) {
            Some(f) => f.ty = ty,
            None => fields.push(Field::new(name, ty)),
        }
    }

    for op in ops {
        match op {
            RowOp::Trim { .. } => {}
            RowOp::ToInt { field } => upsert(&mut fields, field, FieldType::Int),
            RowOp::ToFloat { field } => upsert(&mut fields, field, FieldType::Float),
            RowOp::Rename { from, to } => {
                if from != to && fields.iter().any(|f| f.name == *from) {
                    fields.retain(|f| f.name != *to);
                    if let Some(f) = fields.iter_mut().find(|f| f.name == *from) {
                        f.name = to.clone();
                    }
                }
            }
            RowOp::DropField { field } => fields.retain(|f| f.name != *field),
            RowOp::ParseTimestamp { target, .. } => {
                upsert(&mut fields, target, FieldType::Timestamp);
            }
            RowOp::Compute {
                target,
                left,
                right,
                ..
            } => {
                let int_only = [left, right].iter().all(|name| {
                    matches!(
                        fields.iter().find(|f| f.name == **name).map(|f| f.ty),
                        Some(FieldType::Int)
                    )
                });
                let ty = if int_only { FieldType::Int } else { FieldType::Float };
                upsert(&mut fields, target, ty);
            }
        }
    }
    Schema::new(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Individual ops
    // =========================================================================

    #[test]
    fn test_trim() {
        let r = Record::new().with_field("Description", "  WHITE HEART  ");
        let r = RowOp::Trim { field: "Description".into() }.apply(r);
        assert_eq!(r.get_str("Description"), Some("WHITE HEART"));

        let r = Record::new().with_field("Description", "   ");
        let r = RowOp::Trim { field: "Description".into() }.apply(r);
        assert_eq!(r.get("Description"), Some(&Value::Null));
    }

    #[test]
    fn test_to_int_and_to_float() {
        let r = Record::new().with_field("Quantity", "6").with_field("UnitPrice", "2.55");
        let r = RowOp::ToInt { field: "Quantity".into() }.apply(r);
        let r = RowOp::ToFloat { field: "UnitPrice".into() }.apply(r);
        assert_eq!(r.get("Quantity"), Some(&Value::Int(6)));
        assert_eq!(r.get("UnitPrice"), Some(&Value::Float(2.55)));
    }

    #[test]
    fn test_cast_failure_yields_null() {
        let r = Record::new().with_field("Quantity", "six");
        let r = RowOp::ToInt { field: "Quantity".into() }.apply(r);
        assert_eq!(r.get("Quantity"), Some(&Value::Null));
    }

    #[test]
    fn test_rename_keeps_position() {
        let r = Record::new()
            .with_field("a", 1i64)
            .with_field("b", 2i64)
            .with_field("c", 3i64);
        let r = RowOp::Rename { from: "b".into(), to: "B".into() }.apply(r);
        let names: Vec<&str> = r.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["a", "B", "c"]);
        assert_eq!(r.get_int("B"), Some(2));
    }

    #[test]
    fn test_parse_timestamp_combines_date_and_time() {
        let r = Record::new()
            .with_field("InvoiceDate", "2023-01-01")
            .with_field("InvoiceTime", "10:00");
        let r = RowOp::ParseTimestamp {
            date_field: "InvoiceDate".into(),
            time_field: Some("InvoiceTime".into()),
            target: "InvoiceDatetime".into(),
        }
        .apply(r);
        assert_eq!(
            r.get("InvoiceDatetime"),
            Some(&Value::Timestamp(parse_timestamp("2023-01-01 10:00:00").unwrap()))
        );
    }

    #[test]
    fn test_parse_timestamp_bad_input_yields_null() {
        let r = Record::new().with_field("InvoiceDate", "soon");
        let r = RowOp::ParseTimestamp {
            date_field: "InvoiceDate".into(),
            time_field: None,
            target: "InvoiceDatetime".into(),
        }
        .apply(r);
        assert_eq!(r.get("InvoiceDatetime"), Some(&Value::Null));
    }

    #[test]
    fn test_compute_int_and_float() {
        let r = Record::new().with_field("Quantity", 6i64).with_field("Pack", 2i64);
        let r = RowOp::Compute {
            target: "Total".into(),
            left: "Quantity".into(),
            arith: ArithOp::Mul,
            right: "Pack".into(),
        }
        .apply(r);
        assert_eq!(r.get("Total"), Some(&Value::Int(12)));

        let r = Record::new().with_field("Quantity", 6i64).with_field("UnitPrice", 2.5);
        let r = RowOp::Compute {
            target: "LineTotal".into(),
            left: "Quantity".into(),
            arith: ArithOp::Mul,
            right: "UnitPrice".into(),
        }
        .apply(r);
        assert_eq!(r.get("LineTotal"), Some(&Value::Float(15.0)));
    }

    #[test]
    fn test_compute_with_null_operand_yields_null() {
        let r = Record::new()
            .with_field("Quantity", Value::Null)
            .with_field("UnitPrice", 2.5);
        let r = RowOp::Compute {
            target: "LineTotal".into(),
            left: "Quantity".into(),
            arith: ArithOp::Mul,
            right: "UnitPrice".into(),
        }
        .apply(r);
        assert_eq!(r.get("LineTotal"), Some(&Value::Null));
    }

    // =========================================================================
    // Op chains
    // =========================================================================

    #[test]
    fn test_apply_ops_in_order() {
        let ops = vec![
            RowOp::ToInt { field: "Quantity".into() },
            RowOp::ParseTimestamp {
                date_field: "InvoiceDate".into(),
                time_field: Some("InvoiceTime".into()),
                target: "InvoiceDatetime".into(),
            },
            RowOp::DropField { field: "InvoiceDate".into() },
            RowOp::DropField { field: "InvoiceTime".into() },
        ];
        let r = Record::new()
            .with_field("Quantity", "5")
            .with_field("InvoiceDate", "2023-01-01")
            .with_field("InvoiceTime", "10:00");
        let r = apply_ops(&ops, r);
        assert_eq!(r.get_int("Quantity"), Some(5));
        assert!(!r.contains_field("InvoiceDate"));
        assert!(r.get_timestamp_nanos("InvoiceDatetime").is_some());
    }

    #[test]
    fn test_serde_tagged_shape() {
        let op: RowOp = serde_json::from_str(
            r#"{"op": "parse_timestamp", "date_field": "InvoiceDate", "time_field": "InvoiceTime", "target": "InvoiceDatetime"}"#,
        )
        .unwrap();
        assert!(matches!(op, RowOp::ParseTimestamp { .. }));
    }

    #[test]
    fn test_rename_missing_source_leaves_target_alone() {
        let r = Record::new().with_field("b", 1i64);
        let r = RowOp::Rename {
            from: "a".into(),
            to: "b".into(),
        }
        .apply(r);
        assert_eq!(r.get_int("b"), Some(1));
    }

    // =========================================================================
    // Schema derivation
    // =========================================================================

    #[test]
    fn test_output_schema_follows_ops() {
        use tidemill_core::{Field, FieldType, Schema};
        let input = Schema::new(vec![
            Field::new("Quantity", FieldType::Str),
            Field::new("UnitPrice", FieldType::Str),
            Field::new("InvoiceDate", FieldType::Str),
            Field::new("InvoiceTime", FieldType::Str),
        ]);
        let ops = vec![
            RowOp::ToInt { field: "Quantity".into() },
            RowOp::ToFloat { field: "UnitPrice".into() },
            RowOp::ParseTimestamp {
                date_field: "InvoiceDate".into(),
                time_field: Some("InvoiceTime".into()),
                target: "InvoiceDatetime".into(),
            },
            RowOp::DropField { field: "InvoiceDate".into() },
            RowOp::DropField { field: "InvoiceTime".into() },
            RowOp::Compute {
                target: "LineTotal".into(),
                left: "Quantity".into(),
                arith: ArithOp::Mul,
                right: "UnitPrice".into(),
            },
        ];
        let out = output_schema(&input, &ops);
        assert_eq!(out.field("Quantity").map(|f| f.ty), Some(FieldType::Int));
        assert_eq!(out.field("UnitPrice").map(|f| f.ty), Some(FieldType::Float));
        assert_eq!(
            out.field("InvoiceDatetime").map(|f| f.ty),
            Some(FieldType::Timestamp)
        );
        assert!(!out.contains("InvoiceDate"));
        // Int * Float promotes
        assert_eq!(out.field("LineTotal").map(|f| f.ty), Some(FieldType::Float));
    }

    #[test]
    fn test_output_schema_int_compute_stays_int() {
        use tidemill_core::{Field, FieldType, Schema};
        let input = Schema::new(vec![
            Field::new("a", FieldType::Int),
            Field::new("b", FieldType::Int),
        ]);
        let ops = vec![RowOp::Compute {
            target: "c".into(),
            left: "a".into(),
            arith: ArithOp::Add,
            right: "b".into(),
        }];
        let out = output_schema(&input, &ops);
        assert_eq!(out.field("c").map(|f| f.ty), Some(FieldType::Int));
    }
}

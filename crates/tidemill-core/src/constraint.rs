//! Data-quality constraint definitions.
//!
//! A [`Constraint`] is a named boolean predicate over one record field plus a
//! [`ViolationPolicy`]. Constraints are declared in the pipeline config,
//! validated against the stage schema before any row is processed, and
//! evaluated per row by the runtime's constraint evaluator.
//!
//! Evaluation is deliberately two-layered: [`Predicate::eval`] returns
//! `Result<bool, PredicateError>` so that a type clash or null operand is a
//! recoverable *violation* at the call site, never a panic or a run failure.

use crate::types::Schema;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// What to do with a row that violates a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationPolicy {
    /// Remove the row from the stage output (it routes to quarantine).
    #[default]
    Drop,
    /// Abort the stage run before committing anything.
    Fail,
}

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    NotNull,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl PredicateOp {
    /// Operators other than `not_null` compare against a literal.
    pub fn needs_literal(&self) -> bool {
        !matches!(self, PredicateOp::NotNull)
    }
}

impl fmt::Display for PredicateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PredicateOp::NotNull => "not_null",
            PredicateOp::Gt => ">",
            PredicateOp::Ge => ">=",
            PredicateOp::Lt => "<",
            PredicateOp::Le => "<=",
            PredicateOp::Eq => "==",
            PredicateOp::Ne => "!=",
        };
        write!(f, "{s}")
    }
}

/// A single-field boolean predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub op: PredicateOp,
    /// Comparison literal; required for every operator except `not_null`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Predicate {
    /// Evaluate against the field's value as found in a record.
    ///
    /// `field_value` is `None` when the record has no such field at all.
    /// `not_null` never errors; every comparison errors on null/missing
    /// operands or incomparable types, and the caller counts an error as a
    /// violation.
    pub fn eval(&self, field_value: Option<&Value>) -> Result<bool, PredicateError> {
        match self.op {
            PredicateOp::NotNull => Ok(matches!(field_value, Some(v) if !v.is_null())),
            op => {
                let lhs = match field_value {
                    Some(v) if !v.is_null() => v,
                    _ => {
                        return Err(PredicateError::NullOperand {
                            field: self.field.clone(),
                        })
                    }
                };
                let rhs = self.value.as_ref().ok_or_else(|| PredicateError::MissingLiteral {
                    field: self.field.clone(),
                })?;
                let ord = lhs.compare(rhs).ok_or_else(|| PredicateError::Incomparable {
                    field: self.field.clone(),
                    found: lhs.type_name(),
                    literal: rhs.type_name(),
                })?;
                Ok(match op {
                    PredicateOp::Gt => ord == Ordering::Greater,
                    PredicateOp::Ge => ord != Ordering::Less,
                    PredicateOp::Lt => ord == Ordering::Less,
                    PredicateOp::Le => ord != Ordering::Greater,
                    PredicateOp::Eq => ord == Ordering::Equal,
                    PredicateOp::Ne => ord != Ordering::Equal,
                    PredicateOp::NotNull => unreachable!("handled above"),
                })
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.op, &self.value) {
            (PredicateOp::NotNull, _) => write!(f, "{} not_null", self.field),
            (op, Some(v)) => write!(f, "{} {} {}", self.field, op, v),
            (op, None) => write!(f, "{} {} <missing>", self.field, op),
        }
    }
}

/// A named predicate with its violation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    #[serde(flatten)]
    pub predicate: Predicate,
    #[serde(default)]
    pub policy: ViolationPolicy,
}

impl Constraint {
    pub fn new(name: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            name: name.into(),
            predicate,
            policy: ViolationPolicy::Drop,
        }
    }

    pub fn with_policy(mut self, policy: ViolationPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Check a constraint set against the stage schema.
///
/// Referencing an unknown field or omitting a required literal is a
/// configuration error: it aborts pipeline construction before any row is
/// processed.
pub fn validate_constraints(constraints: &[Constraint], schema: &Schema) -> Result<(), ConstraintError> {
    for c in constraints {
        if !schema.contains(&c.predicate.field) {
            return Err(ConstraintError::UnknownField {
                constraint: c.name.clone(),
                field: c.predicate.field.clone(),
            });
        }
        if c.predicate.op.needs_literal() && c.predicate.value.is_none() {
            return Err(ConstraintError::MissingLiteral {
                constraint: c.name.clone(),
                op: c.predicate.op,
            });
        }
    }
    Ok(())
}

/// Runtime predicate evaluation failure. Treated as a violation by callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PredicateError {
    #[error("field '{field}' is null or missing")]
    NullOperand { field: String },

    #[error("predicate on field '{field}' has no comparison literal")]
    MissingLiteral { field: String },

    #[error("cannot compare {found} value in field '{field}' against {literal} literal")]
    Incomparable {
        field: String,
        found: &'static str,
        literal: &'static str,
    },
}

/// Definition-time constraint configuration failure. Fatal before start.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConstraintError {
    #[error("constraint '{constraint}' references unknown field '{field}'")]
    UnknownField { constraint: String, field: String },

    #[error("constraint '{constraint}' uses operator {op} without a comparison value")]
    MissingLiteral { constraint: String, op: PredicateOp },
}

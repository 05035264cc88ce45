//! # Tidemill Core
//!
//! Foundational types for the Tidemill pipeline engine.
//!
//! This crate provides the data model shared by the runtime and the CLI:
//!
//! - **Values**: runtime scalar representation with type coercion and
//!   cross-type comparison
//! - **Schemas**: declared field lists used to validate and coerce raw
//!   source rows
//! - **Constraints**: named data-quality predicates with violation policies,
//!   validated against a schema before the pipeline starts
//!
//! ## Quick Start
//!
//! ```rust
//! use tidemill_core::{Constraint, Predicate, PredicateOp, Value};
//!
//! let v = Value::Int(42);
//! assert_eq!(v.as_int(), Some(42));
//!
//! let gate = Constraint::new(
//!     "positive_quantity",
//!     Predicate {
//!         field: "Quantity".into(),
//!         op: PredicateOp::Gt,
//!         value: Some(Value::Int(0)),
//!     },
//! );
//! assert!(gate.predicate.eval(Some(&v)).unwrap());
//! ```

pub mod constraint;
pub mod types;
pub mod value;

pub use constraint::{
    validate_constraints, Constraint, ConstraintError, Predicate, PredicateError, PredicateOp,
    ViolationPolicy,
};
pub use types::{parse_timestamp, Field, FieldType, Schema};
pub use value::Value;

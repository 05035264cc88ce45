//! Per-row constraint evaluation and quality/quarantine routing.
//!
//! The evaluator runs a stage's whole constraint set against each record and
//! reports every violated constraint, not just the first. A predicate that
//! fails to evaluate (type clash, null operand) counts as violated: malformed
//! rows route to quarantine, they never abort the run.
//!
//! Routing is complement-based. A quality stage keeps rows whose verdict is
//! `Pass`; its quarantine twin evaluates the same constraint set and keeps
//! rows with at least one violation. Because both sides share one predicate
//! evaluation, every upstream row lands in exactly one output.

use crate::record::Record;
use tidemill_core::{Constraint, ViolationPolicy};
use tracing::debug;

/// Outcome of evaluating a constraint set against one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Names of every violated constraint, in declaration order.
    Violations(Vec<String>),
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Which side of the constraint gate a stage keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteMode {
    /// Keep rows that satisfy every constraint.
    #[default]
    Quality,
    /// Keep rows that violate at least one constraint.
    Complement,
}

/// Evaluates one stage's constraint set.
#[derive(Debug, Clone, Default)]
pub struct ConstraintEvaluator {
    constraints: Vec<Constraint>,
}

impl ConstraintEvaluator {
    pub fn new(constraints: Vec<Constraint>) -> Self {
        Self { constraints }
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Evaluate every constraint against the record.
    pub fn evaluate(&self, record: &Record) -> Verdict {
        let mut violated = Vec::new();
        for c in &self.constraints {
            let holds = match c.predicate.eval(record.get(&c.predicate.field)) {
                Ok(b) => b,
                Err(e) => {
                    debug!(constraint = %c.name, error = %e, "predicate failed to evaluate, counting as violation");
                    false
                }
            };
            if !holds {
                violated.push(c.name.clone());
            }
        }
        if violated.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Violations(violated)
        }
    }

    /// Whether a stage with the given routing keeps a record with this verdict.
    pub fn accepts(&self, verdict: &Verdict, mode: RouteMode) -> bool {
        match mode {
            RouteMode::Quality => verdict.passed(),
            RouteMode::Complement => !verdict.passed(),
        }
    }

    /// First violated constraint whose policy aborts the run, if any.
    pub fn fail_violation<'a>(&'a self, verdict: &Verdict) -> Option<&'a Constraint> {
        let Verdict::Violations(names) = verdict else {
            return None;
        };
        self.constraints
            .iter()
            .find(|c| c.policy == ViolationPolicy::Fail && names.iter().any(|n| n == &c.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemill_core::{Predicate, PredicateOp, Value};

    fn evaluator() -> ConstraintEvaluator {
        ConstraintEvaluator::new(vec![
            Constraint::new(
                "valid_customer",
                Predicate {
                    field: "CustomerID".into(),
                    op: PredicateOp::NotNull,
                    value: None,
                },
            ),
            Constraint::new(
                "positive_quantity",
                Predicate {
                    field: "Quantity".into(),
                    op: PredicateOp::Gt,
                    value: Some(Value::Int(0)),
                },
            ),
        ])
    }

    fn good_row() -> Record {
        Record::new().with_field("CustomerID", "123").with_field("Quantity", 5i64)
    }

    // =========================================================================
    // Verdicts
    // =========================================================================

    #[test]
    fn test_pass() {
        assert_eq!(evaluator().evaluate(&good_row()), Verdict::Pass);
    }

    #[test]
    fn test_reports_all_violations_not_just_first() {
        let row = Record::new()
            .with_field("CustomerID", Value::Null)
            .with_field("Quantity", -1i64);
        let verdict = evaluator().evaluate(&row);
        assert_eq!(
            verdict,
            Verdict::Violations(vec!["valid_customer".into(), "positive_quantity".into()])
        );
    }

    #[test]
    fn test_eval_error_counts_as_violation() {
        // Quantity arrives as text: the gt predicate cannot compare it
        let row = Record::new()
            .with_field("CustomerID", "123")
            .with_field("Quantity", "lots");
        let verdict = evaluator().evaluate(&row);
        assert_eq!(verdict, Verdict::Violations(vec!["positive_quantity".into()]));
    }

    #[test]
    fn test_missing_field_counts_as_violation() {
        let row = Record::new().with_field("CustomerID", "123");
        let verdict = evaluator().evaluate(&row);
        assert_eq!(verdict, Verdict::Violations(vec!["positive_quantity".into()]));
    }

    // =========================================================================
    // Routing
    // =========================================================================

    #[test]
    fn test_routing_is_mutually_exclusive() {
        let ev = evaluator();
        let rows = vec![
            good_row(),
            Record::new().with_field("CustomerID", Value::Null).with_field("Quantity", 5i64),
            Record::new().with_field("CustomerID", "9").with_field("Quantity", 0i64),
            Record::new().with_field("CustomerID", "9").with_field("Quantity", "bad"),
        ];
        for row in &rows {
            let verdict = ev.evaluate(row);
            let quality = ev.accepts(&verdict, RouteMode::Quality);
            let quarantine = ev.accepts(&verdict, RouteMode::Complement);
            assert!(quality ^ quarantine, "row must land on exactly one side: {row}");
        }
    }

    #[test]
    fn test_empty_constraint_set_passes_everything() {
        let ev = ConstraintEvaluator::default();
        let verdict = ev.evaluate(&Record::new());
        assert!(ev.accepts(&verdict, RouteMode::Quality));
        assert!(!ev.accepts(&verdict, RouteMode::Complement));
    }

    // =========================================================================
    // Policies
    // =========================================================================

    #[test]
    fn test_fail_policy_detected() {
        let ev = ConstraintEvaluator::new(vec![Constraint::new(
            "hard_gate",
            Predicate {
                field: "Quantity".into(),
                op: PredicateOp::NotNull,
                value: None,
            },
        )
        .with_policy(ViolationPolicy::Fail)]);
        let verdict = ev.evaluate(&Record::new());
        assert_eq!(ev.fail_violation(&verdict).map(|c| c.name.as_str()), Some("hard_gate"));
        assert!(evaluator().fail_violation(&Verdict::Pass).is_none());
    }
}

//! Aggregate view maintenance over the current-state table.
//!
//! Each [`ViewSpec`] is a pure reduction: group-by columns plus aggregate
//! functions, with an optional order/limit for top-N views. Views are
//! recomputed in full from a state snapshot on every commit; the swap into
//! the materialized results is atomic, so a reader after a commit always
//! sees that commit's effects, tagged with the state version they came from.
//!
//! When an export directory is configured, refreshed views are also written
//! as JSONL tables for external reporting tools. Export failures surface as
//! errors after the in-memory swap, so the maintainer can be retried alone
//! without re-running the merge.

use crate::merge::StateSnapshot;
use crate::record::{FxIndexMap, Record, SharedRecord};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::RwLock;
use tidemill_core::{Schema, Value};
use tracing::{debug, info};

/// An aggregate function over a group of rows.
pub trait AggregateFunc: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compute the aggregate over the group. `field` carries the input
    /// column for functions that take one.
    fn apply(&self, rows: &[SharedRecord], field: Option<&str>) -> Value;
}

/// Sum of a numeric column. Ints stay ints until a float appears; null and
/// non-numeric cells are skipped.
pub struct Sum;

impl AggregateFunc for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn apply(&self, rows: &[SharedRecord], field: Option<&str>) -> Value {
        let Some(field) = field else {
            return Value::Null;
        };
        let mut int_sum: i64 = 0;
        let mut float_sum: f64 = 0.0;
        let mut saw_float = false;
        let mut saw_any = false;
        for row in rows {
            match row.get(field) {
                Some(Value::Int(i)) => {
                    saw_any = true;
                    int_sum += i;
                }
                Some(Value::Float(f)) if f.is_finite() => {
                    saw_any = true;
                    saw_float = true;
                    float_sum += f;
                }
                _ => {}
            }
        }
        if !saw_any {
            Value::Int(0)
        } else if saw_float {
            Value::Float(float_sum + int_sum as f64)
        } else {
            Value::Int(int_sum)
        }
    }
}

/// Row count; with a field, count of rows where that field is non-null.
pub struct Count;

impl AggregateFunc for Count {
    fn name(&self) -> &'static str {
        "count"
    }

    fn apply(&self, rows: &[SharedRecord], field: Option<&str>) -> Value {
        match field {
            None => Value::Int(rows.len() as i64),
            Some(f) => Value::Int(
                rows.iter()
                    .filter(|r| r.get(f).map(|v| !v.is_null()).unwrap_or(false))
                    .count() as i64,
            ),
        }
    }
}

/// Count of distinct non-null values in a column.
pub struct CountDistinct;

impl AggregateFunc for CountDistinct {
    fn name(&self) -> &'static str {
        "count_distinct"
    }

    fn apply(&self, rows: &[SharedRecord], field: Option<&str>) -> Value {
        let Some(field) = field else {
            return Value::Null;
        };
        let mut seen: HashSet<GroupAtom> = HashSet::new();
        for row in rows {
            if let Some(v) = row.get(field) {
                if !v.is_null() {
                    seen.insert(GroupAtom::from_value(v));
                }
            }
        }
        Value::Int(seen.len() as i64)
    }
}

/// Which aggregate function a view column uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggKind {
    Sum,
    Count,
    #[serde(alias = "distinct")]
    CountDistinct,
}

impl AggKind {
    fn func(&self) -> &'static dyn AggregateFunc {
        match self {
            AggKind::Sum => &Sum,
            AggKind::Count => &Count,
            AggKind::CountDistinct => &CountDistinct,
        }
    }

    fn needs_field(&self) -> bool {
        !matches!(self, AggKind::Count)
    }
}

/// One output column of a view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Output column name.
    pub name: String,
    pub agg: AggKind,
    /// Input column; optional only for `count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// A registered aggregate view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSpec {
    pub name: String,
    pub group_by: Vec<String>,
    pub aggregates: Vec<AggregateSpec>,
    /// Output column to order by, for top-N views.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    /// Largest-first when ordering; top-N views rank descending.
    #[serde(default = "default_descending")]
    pub descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

fn default_descending() -> bool {
    true
}

/// A computed view: group-by columns + aggregate columns per row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaterializedView {
    pub name: String,
    pub rows: Vec<Record>,
    /// State version this view was computed from.
    pub version: u64,
}

/// Hashable canonical form of a grouping value. Unlike merge keys, null is a
/// legitimate group of its own here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupAtom {
    Null,
    Bool(bool),
    Int(i64),
    Bits(u64),
    Str(String),
    Timestamp(i64),
}

impl GroupAtom {
    fn from_value(v: &Value) -> Self {
        match v {
            Value::Null => GroupAtom::Null,
            Value::Bool(b) => GroupAtom::Bool(*b),
            Value::Int(i) => GroupAtom::Int(*i),
            Value::Float(f) => GroupAtom::Bits(f.to_bits()),
            Value::Str(s) => GroupAtom::Str(s.clone()),
            Value::Timestamp(ns) => GroupAtom::Timestamp(*ns),
        }
    }
}

type GroupKey = SmallVec<[GroupAtom; 2]>;

/// Deterministic value ordering for view output: typed comparison first,
/// textual fallback for mixed types.
fn cmp_values(a: &Value, b: &Value) -> Ordering {
    a.compare(b)
        .unwrap_or_else(|| a.to_string().cmp(&b.to_string()))
}

/// Compute one view from a snapshot's rows.
pub fn compute_view(spec: &ViewSpec, rows: &[SharedRecord], version: u64) -> MaterializedView {
    // Group rows, remembering first-seen group order and the key values
    let mut groups: FxIndexMap<GroupKey, (Vec<Value>, Vec<SharedRecord>)> = FxIndexMap::default();
    for row in rows {
        let mut key: GroupKey = SmallVec::new();
        let mut key_values = Vec::with_capacity(spec.group_by.len());
        for col in &spec.group_by {
            let v = row.get(col).cloned().unwrap_or(Value::Null);
            key.push(GroupAtom::from_value(&v));
            key_values.push(v);
        }
        groups
            .entry(key)
            .or_insert_with(|| (key_values, Vec::new()))
            .1
            .push(row.clone());
    }

    let mut out: Vec<Record> = groups
        .into_iter()
        .map(|(_, (key_values, members))| {
            let mut record = Record::new();
            for (col, v) in spec.group_by.iter().zip(key_values) {
                record.set(col.clone(), v);
            }
            for agg in &spec.aggregates {
                let value = agg.agg.func().apply(&members, agg.field.as_deref());
                record.set(agg.name.clone(), value);
            }
            record
        })
        .collect();

    match &spec.order_by {
        Some(col) => {
            out.sort_by(|a, b| {
                let av = a.get(col).cloned().unwrap_or(Value::Null);
                let bv = b.get(col).cloned().unwrap_or(Value::Null);
                let ord = cmp_values(&av, &bv);
                if spec.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        None => {
            // Sort by group columns so recomputed output is reproducible
            out.sort_by(|a, b| {
                for col in &spec.group_by {
                    let av = a.get(col).cloned().unwrap_or(Value::Null);
                    let bv = b.get(col).cloned().unwrap_or(Value::Null);
                    match cmp_values(&av, &bv) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                Ordering::Equal
            });
        }
    }

    if let Some(limit) = spec.limit {
        out.truncate(limit);
    }

    MaterializedView {
        name: spec.name.clone(),
        rows: out,
        version,
    }
}

/// Check view definitions against the merged-row schema.
pub fn validate_views(views: &[ViewSpec], schema: &Schema) -> Result<(), ViewError> {
    for view in views {
        for col in &view.group_by {
            if !schema.contains(col) {
                return Err(ViewError::UnknownColumn {
                    view: view.name.clone(),
                    column: col.clone(),
                });
            }
        }
        for agg in &view.aggregates {
            match &agg.field {
                Some(f) if !schema.contains(f) => {
                    return Err(ViewError::UnknownColumn {
                        view: view.name.clone(),
                        column: f.clone(),
                    });
                }
                None if agg.agg.needs_field() => {
                    return Err(ViewError::MissingField {
                        view: view.name.clone(),
                        aggregate: agg.name.clone(),
                    });
                }
                _ => {}
            }
        }
        if let Some(order_col) = &view.order_by {
            let known = view.group_by.iter().any(|c| c == order_col)
                || view.aggregates.iter().any(|a| &a.name == order_col);
            if !known {
                return Err(ViewError::UnknownOrderColumn {
                    view: view.name.clone(),
                    column: order_col.clone(),
                });
            }
        }
    }
    Ok(())
}

/// View definition error, fatal at configuration time.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ViewError {
    #[error("view '{view}' references unknown column '{column}'")]
    UnknownColumn { view: String, column: String },

    #[error("view '{view}' aggregate '{aggregate}' requires an input field")]
    MissingField { view: String, aggregate: String },

    #[error("view '{view}' orders by '{column}', which is neither a group column nor an aggregate")]
    UnknownOrderColumn { view: String, column: String },
}

/// Aggregate refresh failure. The in-memory views have already swapped when
/// an export error surfaces, so retrying the maintainer alone is safe.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("failed to export view '{view}' to {path}: {message}")]
    Export {
        view: String,
        path: PathBuf,
        message: String,
    },
}

struct MaintainerInner {
    views: FxIndexMap<String, MaterializedView>,
    version: Option<u64>,
}

/// Recomputes and serves materialized views.
pub struct AggregateMaintainer {
    specs: Vec<ViewSpec>,
    export_dir: Option<PathBuf>,
    inner: RwLock<MaintainerInner>,
}

impl AggregateMaintainer {
    pub fn new(specs: Vec<ViewSpec>) -> Self {
        Self {
            specs,
            export_dir: None,
            inner: RwLock::new(MaintainerInner {
                views: FxIndexMap::default(),
                version: None,
            }),
        }
    }

    /// Also write refreshed views as `<dir>/<view>.jsonl`.
    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = Some(dir.into());
        self
    }

    pub fn specs(&self) -> &[ViewSpec] {
        &self.specs
    }

    /// State version the served views were computed from.
    pub fn version(&self) -> Option<u64> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).version
    }

    /// Recompute every view from the snapshot and swap atomically.
    pub fn refresh(&self, snapshot: &StateSnapshot) -> Result<(), AggregateError> {
        let computed: FxIndexMap<String, MaterializedView> = self
            .specs
            .iter()
            .map(|spec| {
                let view = compute_view(spec, &snapshot.rows, snapshot.version);
                (spec.name.clone(), view)
            })
            .collect();

        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.views = computed;
            inner.version = Some(snapshot.version);
        }
        debug!(version = snapshot.version, views = self.specs.len(), "aggregate views refreshed");

        if let Some(dir) = &self.export_dir {
            self.export(dir)?;
        }
        Ok(())
    }

    fn export(&self, dir: &PathBuf) -> Result<(), AggregateError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        for view in inner.views.values() {
            let path = dir.join(format!("{}.jsonl", view.name));
            write_view(&path, view).map_err(|e| AggregateError::Export {
                view: view.name.clone(),
                path: path.clone(),
                message: e.to_string(),
            })?;
            info!(view = %view.name, rows = view.rows.len(), path = %path.display(), "exported view");
        }
        Ok(())
    }

    /// Read a materialized view by name.
    pub fn read_view(&self, name: &str) -> Option<MaterializedView> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.views.get(name).cloned()
    }
}

fn write_view(path: &PathBuf, view: &MaterializedView) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        for row in &view.rows {
            let line = serde_json::to_string(&row.fields)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(file, "{line}")?;
        }
    }
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemill_core::{Field, FieldType};

    fn row(country: &str, customer: &str, quantity: i64) -> SharedRecord {
        Record::new()
            .with_field("Country", country)
            .with_field("CustomerID", customer)
            .with_field("Quantity", quantity)
            .into_shared()
    }

    fn sales_by_country() -> ViewSpec {
        ViewSpec {
            name: "sales_by_country".into(),
            group_by: vec!["Country".into()],
            aggregates: vec![AggregateSpec {
                name: "TotalSales".into(),
                agg: AggKind::Sum,
                field: Some("Quantity".into()),
            }],
            order_by: None,
            descending: true,
            limit: None,
        }
    }

    fn top_customers(limit: usize) -> ViewSpec {
        ViewSpec {
            name: "top_ten_customers".into(),
            group_by: vec!["CustomerID".into()],
            aggregates: vec![AggregateSpec {
                name: "TotalQuantity".into(),
                agg: AggKind::Sum,
                field: Some("Quantity".into()),
            }],
            order_by: Some("TotalQuantity".into()),
            descending: true,
            limit: Some(limit),
        }
    }

    // =========================================================================
    // Aggregate functions
    // =========================================================================

    #[test]
    fn test_sum_int_and_mixed() {
        let rows = vec![row("UK", "a", 2), row("UK", "b", 3)];
        assert_eq!(Sum.apply(&rows, Some("Quantity")), Value::Int(5));

        let mixed = vec![
            Record::new().with_field("x", 2i64).into_shared(),
            Record::new().with_field("x", 0.5).into_shared(),
        ];
        assert_eq!(Sum.apply(&mixed, Some("x")), Value::Float(2.5));
    }

    #[test]
    fn test_sum_skips_null_and_nonnumeric() {
        let rows = vec![
            Record::new().with_field("x", 2i64).into_shared(),
            Record::new().with_field("x", Value::Null).into_shared(),
            Record::new().with_field("x", "three").into_shared(),
        ];
        assert_eq!(Sum.apply(&rows, Some("x")), Value::Int(2));
    }

    #[test]
    fn test_sum_empty_group_is_zero() {
        assert_eq!(Sum.apply(&[], Some("x")), Value::Int(0));
    }

    #[test]
    fn test_count_variants() {
        let rows = vec![
            Record::new().with_field("x", 1i64).into_shared(),
            Record::new().with_field("x", Value::Null).into_shared(),
        ];
        assert_eq!(Count.apply(&rows, None), Value::Int(2));
        assert_eq!(Count.apply(&rows, Some("x")), Value::Int(1));
    }

    #[test]
    fn test_count_distinct() {
        let rows = vec![
            Record::new().with_field("c", "a").into_shared(),
            Record::new().with_field("c", "a").into_shared(),
            Record::new().with_field("c", "b").into_shared(),
            Record::new().with_field("c", Value::Null).into_shared(),
        ];
        assert_eq!(CountDistinct.apply(&rows, Some("c")), Value::Int(2));
    }

    // =========================================================================
    // View computation
    // =========================================================================

    #[test]
    fn test_group_by_sums_per_group() {
        let rows = vec![row("UK", "a", 2), row("UK", "b", 3), row("FR", "c", 7)];
        let view = compute_view(&sales_by_country(), &rows, 1);
        assert_eq!(view.rows.len(), 2);
        // Unordered views sort by group columns
        assert_eq!(view.rows[0].get_str("Country"), Some("FR"));
        assert_eq!(view.rows[0].get_int("TotalSales"), Some(7));
        assert_eq!(view.rows[1].get_str("Country"), Some("UK"));
        assert_eq!(view.rows[1].get_int("TotalSales"), Some(5));
    }

    #[test]
    fn test_top_n_orders_descending_and_limits() {
        let rows = vec![
            row("UK", "a", 5),
            row("UK", "b", 9),
            row("FR", "c", 2),
            row("FR", "b", 4),
        ];
        let view = compute_view(&top_customers(2), &rows, 1);
        assert_eq!(view.rows.len(), 2);
        assert_eq!(view.rows[0].get_str("CustomerID"), Some("b"));
        assert_eq!(view.rows[0].get_int("TotalQuantity"), Some(13));
        assert_eq!(view.rows[1].get_str("CustomerID"), Some("a"));
    }

    #[test]
    fn test_view_of_empty_state_is_empty() {
        let view = compute_view(&sales_by_country(), &[], 0);
        assert!(view.rows.is_empty());
    }

    #[test]
    fn test_aggregate_consistency_invariant() {
        let rows = vec![row("UK", "a", 2), row("UK", "b", 3), row("FR", "c", 7), row("DE", "d", 1)];
        let view = compute_view(&sales_by_country(), &rows, 1);
        let view_total: i64 = view.rows.iter().filter_map(|r| r.get_int("TotalSales")).sum();
        let state_total: i64 = rows.iter().filter_map(|r| r.get_int("Quantity")).sum();
        assert_eq!(view_total, state_total);
    }

    // =========================================================================
    // Maintainer
    // =========================================================================

    #[test]
    fn test_refresh_and_read_are_consistent() {
        let maintainer = AggregateMaintainer::new(vec![sales_by_country()]);
        assert!(maintainer.read_view("sales_by_country").is_none());

        let snapshot = StateSnapshot {
            rows: vec![row("UK", "a", 2)],
            version: 3,
        };
        maintainer.refresh(&snapshot).unwrap();

        let view = maintainer.read_view("sales_by_country").unwrap();
        assert_eq!(view.version, 3);
        assert_eq!(view.rows[0].get_int("TotalSales"), Some(2));
        assert_eq!(maintainer.version(), Some(3));
    }

    #[test]
    fn test_export_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let maintainer =
            AggregateMaintainer::new(vec![sales_by_country()]).with_export_dir(dir.path());
        let snapshot = StateSnapshot {
            rows: vec![row("UK", "a", 2), row("FR", "b", 3)],
            version: 1,
        };
        maintainer.refresh(&snapshot).unwrap();

        let contents =
            std::fs::read_to_string(dir.path().join("sales_by_country.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(first["Country"], "FR");
    }

    // =========================================================================
    // Validation
    // =========================================================================

    fn merged_schema() -> Schema {
        Schema::new(vec![
            Field::new("Country", FieldType::Str),
            Field::new("CustomerID", FieldType::Str),
            Field::new("Quantity", FieldType::Int),
        ])
    }

    #[test]
    fn test_validate_ok() {
        assert!(validate_views(&[sales_by_country(), top_customers(10)], &merged_schema()).is_ok());
    }

    #[test]
    fn test_validate_unknown_column() {
        let mut bad = sales_by_country();
        bad.group_by = vec!["Region".into()];
        assert!(matches!(
            validate_views(&[bad], &merged_schema()),
            Err(ViewError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_validate_sum_needs_field() {
        let bad = ViewSpec {
            name: "v".into(),
            group_by: vec!["Country".into()],
            aggregates: vec![AggregateSpec {
                name: "t".into(),
                agg: AggKind::Sum,
                field: None,
            }],
            order_by: None,
            descending: true,
            limit: None,
        };
        assert!(matches!(
            validate_views(&[bad], &merged_schema()),
            Err(ViewError::MissingField { .. })
        ));
    }

    #[test]
    fn test_validate_order_by_must_be_output_column() {
        let mut bad = top_customers(10);
        bad.order_by = Some("Revenue".into());
        assert!(matches!(
            validate_views(&[bad], &merged_schema()),
            Err(ViewError::UnknownOrderColumn { .. })
        ));
    }
}

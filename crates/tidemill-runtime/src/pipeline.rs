//! Pipeline facade: one object owning the stage graph, the current-state
//! table, and the aggregate maintainer, driven cycle by cycle.
//!
//! A cycle runs every stage in dependency order, merges the quality output's
//! new rows into the state table, persists the state snapshot, commits the
//! merge cursor and the connector progress, and then refreshes the aggregate
//! views. The merge commits before the views refresh, so an aggregate
//! failure leaves a committed state table and [`Pipeline::retry_aggregates`]
//! can recover without re-running the merge.

use crate::aggregate::{validate_views, AggregateError, AggregateMaintainer, MaterializedView};
use crate::graph::{StageError, StageGraph};
use crate::merge::{CurrentStateTable, MergeReport};
use crate::metrics::Metrics;
use crate::record::{Record, SharedRecord};
use crate::store::{load_json, save_json, StateStore, StoreError};
use std::sync::Arc;
use tidemill_core::{FieldType, Schema, Value};
use tracing::info;

/// Consumer name under which the merge's cursor is persisted.
const MERGE_CONSUMER: &str = "merge";

/// Store key holding the persisted state snapshot.
const STATE_KEY: &str = "state:rows";

/// Pipeline construction or cycle failure.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("merge input stage '{0}' is not part of the graph")]
    UnknownMergeInput(String),

    #[error(transparent)]
    View(#[from] crate::aggregate::ViewError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("state persistence failure: {0}")]
    Store(#[from] StoreError),
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    /// Rows polled from the connector.
    pub ingested: usize,
    /// Rows each transform stage emitted, in execution order.
    pub stage_outputs: Vec<(String, usize)>,
    pub merge: MergeReport,
    pub views_refreshed: bool,
}

/// The assembled pipeline.
pub struct Pipeline {
    graph: StageGraph,
    state: CurrentStateTable,
    maintainer: AggregateMaintainer,
    merge_input: String,
    store: Arc<dyn StateStore>,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("merge_input", &self.merge_input)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Assemble a pipeline and restore any persisted state.
    ///
    /// Fails when the merge input is not a graph output or a view references
    /// a column the merge input's schema does not carry.
    pub fn new(
        graph: StageGraph,
        state: CurrentStateTable,
        maintainer: AggregateMaintainer,
        merge_input: impl Into<String>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, PipelineError> {
        let merge_input = merge_input.into();
        let schema = graph
            .schema_of(&merge_input)
            .ok_or_else(|| PipelineError::UnknownMergeInput(merge_input.clone()))?;
        validate_views(maintainer.specs(), schema)?;

        // The merge cursor points into the previous process's logs, like
        // every stage cursor
        graph.reset_read(MERGE_CONSUMER, &merge_input)?;

        if let Some(rows) = load_json::<Vec<Record>>(store.as_ref(), STATE_KEY)? {
            let batch = revive_by_schema(schema, rows);
            let report = state.apply_changes(&batch);
            info!(rows = report.state_rows, "restored state table");
        }

        Ok(Self {
            graph,
            state,
            maintainer,
            merge_input,
            store,
            metrics: None,
        })
    }

    /// Enable Prometheus metrics for merge outcomes.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn state(&self) -> &CurrentStateTable {
        &self.state
    }

    pub fn aggregates(&self) -> &AggregateMaintainer {
        &self.maintainer
    }

    pub fn merge_input(&self) -> &str {
        &self.merge_input
    }

    /// Read a materialized view by name.
    pub fn view(&self, name: &str) -> Option<MaterializedView> {
        self.maintainer.read_view(name)
    }

    /// Run one full cycle: stages, merge, state persistence, aggregates.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary, PipelineError> {
        let order = self.graph.execution_order().to_vec();
        let mut summary = CycleSummary::default();
        for name in &order {
            let produced = self.graph.run_stage(name).await?;
            if name == self.graph.source_name() {
                summary.ingested = produced.len();
            } else {
                summary.stage_outputs.push((name.clone(), produced.len()));
            }
        }

        let (batch, cursor) = self.graph.read_new(MERGE_CONSUMER, &self.merge_input)?;
        let report = self.state.apply_changes(&batch);
        if let Some(m) = &self.metrics {
            m.record_merge(
                report.discarded_late as u64,
                report.anomalies as u64,
                report.state_rows,
            );
        }
        self.persist_state()?;
        self.graph.commit_read(MERGE_CONSUMER, &self.merge_input, cursor)?;
        self.graph.commit_source()?;
        summary.merge = report.clone();

        // State is committed; view refresh failures leave it intact and are
        // retriable on their own
        let snapshot = self.state.snapshot();
        if report.changed() || self.maintainer.version() != Some(snapshot.version) {
            self.maintainer.refresh(&snapshot)?;
            summary.views_refreshed = true;
        }

        info!(
            ingested = summary.ingested,
            merged = report.inserted + report.replaced,
            late = report.discarded_late,
            state_rows = report.state_rows,
            "cycle committed"
        );
        Ok(summary)
    }

    /// Recompute the aggregate views from the committed state without
    /// touching the merge.
    pub fn retry_aggregates(&self) -> Result<(), PipelineError> {
        let snapshot = self.state.snapshot();
        self.maintainer.refresh(&snapshot)?;
        Ok(())
    }

    fn persist_state(&self) -> Result<(), StoreError> {
        let snapshot = self.state.snapshot();
        let rows: Vec<&Record> = snapshot.rows.iter().map(|r| r.as_ref()).collect();
        save_json(self.store.as_ref(), STATE_KEY, &rows)
    }
}

/// Untagged JSON cannot tell a timestamp from a plain integer, so persisted
/// rows come back with `Int` in timestamp columns. Re-apply the stage schema
/// the same way ingestion coerces raw rows, or sequence comparisons against
/// fresh `Timestamp` events would be incomparable.
fn revive_by_schema(schema: &Schema, rows: Vec<Record>) -> Vec<SharedRecord> {
    let timestamp_fields: Vec<&str> = schema
        .fields
        .iter()
        .filter(|f| f.ty == FieldType::Timestamp)
        .map(|f| f.name.as_str())
        .collect();
    rows.into_iter()
        .map(|mut record| {
            for name in &timestamp_fields {
                if let Some(slot) = record.fields.get_mut(*name) {
                    if let Value::Int(nanos) = slot {
                        *slot = Value::Timestamp(*nanos);
                    }
                }
            }
            record.into_shared()
        })
        .collect()
}

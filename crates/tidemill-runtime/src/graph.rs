//! The stage graph: registration, incremental cursors, and execution.
//!
//! A graph is built once from stage specs, validated end to end before any
//! row is processed: upstream references resolve, the dependency relation is
//! acyclic, and each stage's constraints are checked against the schema its
//! ops derive. Stages with constraints get a mechanically derived quarantine
//! twin reading the same upstream with the complement acceptance test, so
//! every upstream row lands in exactly one of the two outputs.
//!
//! Each stage run consumes only upstream rows past its persisted cursor and
//! commits output append and cursor advance together. A failed run commits
//! neither, so retries reprocess from the last committed point; redelivered
//! rows flow at least once into the constraint gate and are deduplicated by
//! the merge downstream.
//!
//! Cursors refer to positions in this graph's in-memory output logs, so
//! construction clears any cursor left by a previous process. Durable resume
//! lives with the connector's own progress and the persisted state table.

use crate::connector::SourceConnector;
use crate::evaluator::{ConstraintEvaluator, RouteMode, Verdict};
use crate::metrics::Metrics;
use crate::ops::{apply_ops, output_schema, RowOp};
use crate::quarantine::QuarantineWriter;
use crate::record::{FxIndexMap, SharedRecord};
use crate::store::{load_json, save_json, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tidemill_core::{validate_constraints, Constraint, ConstraintError, Field, Schema};
use tracing::{debug, info, warn};

/// Declarative definition of one transform stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    /// Upstream stage names; the connector's name refers to the source.
    pub upstreams: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<RowOp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
    /// Storage layout hint, recorded and surfaced only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_by: Option<String>,
}

struct StageDefinition {
    spec: StageSpec,
    route: RouteMode,
    evaluator: ConstraintEvaluator,
    schema: Schema,
}

/// Graph construction failure. All of these abort before any row is
/// processed.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{0}' declares no upstreams")]
    NoUpstreams(String),

    #[error("stage '{stage}' references unknown upstream '{upstream}'")]
    UnknownUpstream { stage: String, upstream: String },

    #[error("stage dependency cycle through '{0}'")]
    Cycle(String),

    #[error("stage '{stage}': {source}")]
    Constraint {
        stage: String,
        #[source]
        source: ConstraintError,
    },

    #[error("cursor store failure: {0}")]
    Store(#[from] StoreError),
}

/// Stage run failure. Nothing is committed when a run errors.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("source connector failed: {0}")]
    Source(#[from] crate::connector::ConnectorError),

    #[error("constraint '{constraint}' failed on stage '{stage}', run aborted")]
    ConstraintFailed { stage: String, constraint: String },

    #[error("cursor store failure: {0}")]
    Store(#[from] StoreError),
}

fn cursor_key(consumer: &str, upstream: &str) -> String {
    format!("cursor:{consumer}:{upstream}")
}

/// A validated DAG of transform stages over one source connector.
pub struct StageGraph {
    source: Box<dyn SourceConnector>,
    source_name: String,
    source_schema: Schema,
    stages: FxIndexMap<String, StageDefinition>,
    /// Source first, then stages in dependency order.
    execution_order: Vec<String>,
    logs: HashMap<String, Vec<SharedRecord>>,
    store: Arc<dyn StateStore>,
    quarantine: Option<QuarantineWriter>,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for StageGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageGraph")
            .field("source_name", &self.source_name)
            .field("execution_order", &self.execution_order)
            .finish_non_exhaustive()
    }
}

impl StageGraph {
    /// Build and validate the graph. Constraint and topology problems are
    /// fatal here, before any row is processed.
    pub fn new(
        source: Box<dyn SourceConnector>,
        source_schema: Schema,
        specs: Vec<StageSpec>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, GraphError> {
        let source_name = source.name().to_string();

        let mut seen: HashSet<&str> = HashSet::new();
        for spec in &specs {
            if spec.name == source_name || !seen.insert(spec.name.as_str()) {
                return Err(GraphError::DuplicateStage(spec.name.clone()));
            }
        }
        for spec in &specs {
            if spec.upstreams.is_empty() {
                return Err(GraphError::NoUpstreams(spec.name.clone()));
            }
            for up in &spec.upstreams {
                if up != &source_name && !seen.contains(up.as_str()) {
                    return Err(GraphError::UnknownUpstream {
                        stage: spec.name.clone(),
                        upstream: up.clone(),
                    });
                }
            }
        }

        let order = topological_order(&specs, &source_name)?;
        let by_name: HashMap<&str, &StageSpec> =
            specs.iter().map(|s| (s.name.as_str(), s)).collect();

        let mut schemas: HashMap<String, Schema> = HashMap::new();
        schemas.insert(source_name.clone(), source_schema.clone());
        let mut stages: FxIndexMap<String, StageDefinition> = FxIndexMap::default();

        for name in &order {
            let Some(spec) = by_name.get(name.as_str()) else {
                continue;
            };
            // Input schema is the union of upstream schemas, first
            // occurrence of a field name wins
            let mut input_fields: Vec<Field> = Vec::new();
            for up in &spec.upstreams {
                if let Some(s) = schemas.get(up) {
                    for f in &s.fields {
                        if !input_fields.iter().any(|g| g.name == f.name) {
                            input_fields.push(f.clone());
                        }
                    }
                }
            }
            let schema = output_schema(&Schema::new(input_fields), &spec.ops);
            validate_constraints(&spec.constraints, &schema).map_err(|e| {
                GraphError::Constraint {
                    stage: name.clone(),
                    source: e,
                }
            })?;
            if let Some(p) = &spec.partition_by {
                if !schema.contains(p) {
                    warn!(stage = %name, field = %p, "partition hint names a field absent from the stage output");
                }
            }
            schemas.insert(name.clone(), schema.clone());

            let gated = !spec.constraints.is_empty();
            stages.insert(
                name.clone(),
                StageDefinition {
                    evaluator: ConstraintEvaluator::new(spec.constraints.clone()),
                    route: RouteMode::Quality,
                    schema: schema.clone(),
                    spec: (*spec).clone(),
                },
            );
            info!(stage = %name, upstreams = ?spec.upstreams, constraints = spec.constraints.len(), "registered stage");

            if gated {
                let twin_name = format!("{name}_quarantine");
                if by_name.contains_key(twin_name.as_str()) || stages.contains_key(&twin_name) {
                    return Err(GraphError::DuplicateStage(twin_name));
                }
                let twin_spec = StageSpec {
                    name: twin_name.clone(),
                    upstreams: spec.upstreams.clone(),
                    ops: spec.ops.clone(),
                    constraints: spec.constraints.clone(),
                    partition_by: None,
                };
                stages.insert(
                    twin_name.clone(),
                    StageDefinition {
                        evaluator: ConstraintEvaluator::new(twin_spec.constraints.clone()),
                        route: RouteMode::Complement,
                        schema,
                        spec: twin_spec,
                    },
                );
                info!(stage = %twin_name, derived_from = %name, "registered quarantine stage");
            }
        }

        let mut execution_order = Vec::with_capacity(stages.len() + 1);
        execution_order.push(source_name.clone());
        execution_order.extend(stages.keys().cloned());

        let mut logs: HashMap<String, Vec<SharedRecord>> = HashMap::new();
        for name in &execution_order {
            logs.insert(name.clone(), Vec::new());
        }

        // Cursors from a previous process point into logs that no longer
        // exist; clear them so consumption restarts with the connector's
        // redelivery
        for (name, def) in &stages {
            for up in &def.spec.upstreams {
                store.delete(&cursor_key(name, up))?;
            }
        }

        Ok(Self {
            source,
            source_name,
            source_schema,
            stages,
            execution_order,
            logs,
            store,
            quarantine: None,
            metrics: None,
        })
    }

    /// Route rejected rows to a quarantine log as well.
    pub fn with_quarantine(mut self, writer: QuarantineWriter) -> Self {
        self.quarantine = Some(writer);
        self
    }

    /// Enable Prometheus metrics.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Source first, then stages in dependency order.
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Derived output schema of a stage, or the source schema.
    pub fn schema_of(&self, name: &str) -> Option<&Schema> {
        if name == self.source_name {
            Some(&self.source_schema)
        } else {
            self.stages.get(name).map(|d| &d.schema)
        }
    }

    /// Full output log of a stage, oldest first.
    pub fn output(&self, name: &str) -> Option<&[SharedRecord]> {
        self.logs.get(name).map(|l| l.as_slice())
    }

    /// Rows written to the quarantine log so far.
    pub fn quarantined(&self) -> u64 {
        self.quarantine.as_ref().map(|w| w.count()).unwrap_or(0)
    }

    /// Run one stage over its upstream rows past the committed cursors.
    ///
    /// Returns the newly produced records. Output append and cursor advance
    /// commit together; on error nothing is committed and the same slice is
    /// reprocessed on retry.
    pub async fn run_stage(&mut self, name: &str) -> Result<Vec<SharedRecord>, StageError> {
        if name == self.source_name {
            return self.run_source().await;
        }
        let started = Instant::now();
        let def = self
            .stages
            .get(name)
            .ok_or_else(|| StageError::UnknownStage(name.to_string()))?;

        let mut incoming: Vec<SharedRecord> = Vec::new();
        let mut cursor_commits: Vec<(String, u64)> = Vec::new();
        for up in &def.spec.upstreams {
            let (rows, end) = self.read_new(name, up)?;
            incoming.extend(rows);
            cursor_commits.push((cursor_key(name, up), end));
        }

        let mut emitted: Vec<SharedRecord> = Vec::new();
        let mut quarantine_entries: Vec<(Vec<String>, SharedRecord)> = Vec::new();
        let mut routed_away = 0usize;
        for row in incoming {
            let transformed = apply_ops(&def.spec.ops, (*row).clone()).into_shared();
            if def.evaluator.is_empty() {
                emitted.push(transformed);
                continue;
            }
            let verdict = def.evaluator.evaluate(&transformed);
            if let Some(c) = def.evaluator.fail_violation(&verdict) {
                warn!(stage = name, constraint = %c.name, "failing constraint violated, aborting run");
                return Err(StageError::ConstraintFailed {
                    stage: name.to_string(),
                    constraint: c.name.clone(),
                });
            }
            if matches!(def.route, RouteMode::Quality) {
                if let Verdict::Violations(names) = &verdict {
                    if let Some(m) = &self.metrics {
                        for n in names {
                            m.record_violation(name, n);
                        }
                    }
                }
            }
            if def.evaluator.accepts(&verdict, def.route) {
                if let Verdict::Violations(names) = verdict {
                    quarantine_entries.push((names, transformed.clone()));
                }
                emitted.push(transformed);
            } else {
                routed_away += 1;
            }
        }

        // Commit: quarantine log, output append, then cursors. Append
        // precedes cursor saves so a mid-commit failure redelivers rather
        // than skips.
        let produced = emitted.len();
        let routed = if matches!(def.route, RouteMode::Quality) {
            routed_away
        } else {
            0
        };
        if matches!(def.route, RouteMode::Complement) {
            if let Some(writer) = &self.quarantine {
                for (names, row) in &quarantine_entries {
                    writer.record(name, names, row);
                }
            }
        }
        if let Some(log) = self.logs.get_mut(name) {
            log.extend(emitted.iter().cloned());
        }
        for (key, end) in &cursor_commits {
            save_json(self.store.as_ref(), key, end)?;
        }
        if let Some(m) = &self.metrics {
            m.record_stage_run(name, produced, routed, started.elapsed().as_secs_f64());
        }
        debug!(stage = name, produced, routed, "stage run committed");
        Ok(emitted)
    }

    /// Poll the connector and append its rows to the source log.
    ///
    /// The connector's own progress is not committed here; the driver calls
    /// [`StageGraph::commit_source`] once the cycle has durably landed, so a
    /// failed cycle redelivers.
    async fn run_source(&mut self) -> Result<Vec<SharedRecord>, StageError> {
        let started = Instant::now();
        let batch = self.source.poll().await?;
        let rows: Vec<SharedRecord> = batch
            .into_iter()
            .map(|(record, _source_id)| record.into_shared())
            .collect();
        if let Some(log) = self.logs.get_mut(&self.source_name) {
            log.extend(rows.iter().cloned());
        }
        if let Some(m) = &self.metrics {
            m.record_stage_run(&self.source_name, rows.len(), 0, started.elapsed().as_secs_f64());
        }
        debug!(stage = %self.source_name, rows = rows.len(), "source poll appended");
        Ok(rows)
    }

    /// Persist the connector's progress for everything polled so far.
    pub fn commit_source(&mut self) -> Result<(), StageError> {
        self.source.commit()?;
        Ok(())
    }

    /// New rows of `upstream` past `consumer`'s committed cursor, plus the
    /// cursor value a successful commit should persist. Does not commit.
    pub fn read_new(
        &self,
        consumer: &str,
        upstream: &str,
    ) -> Result<(Vec<SharedRecord>, u64), StageError> {
        let log = self
            .logs
            .get(upstream)
            .ok_or_else(|| StageError::UnknownStage(upstream.to_string()))?;
        let committed: u64 =
            load_json(self.store.as_ref(), &cursor_key(consumer, upstream))?.unwrap_or(0);
        let end = log.len() as u64;
        let from = if committed > end {
            warn!(consumer, upstream, cursor = committed, log = end, "cursor beyond log end, clamping");
            end
        } else {
            committed
        };
        Ok((log[from as usize..].to_vec(), end))
    }

    /// Persist a consumer cursor returned by [`StageGraph::read_new`].
    pub fn commit_read(&self, consumer: &str, upstream: &str, cursor: u64) -> Result<(), StageError> {
        save_json(self.store.as_ref(), &cursor_key(consumer, upstream), &cursor)?;
        Ok(())
    }

    /// Drop a consumer cursor so the next read starts from the log head.
    pub fn reset_read(&self, consumer: &str, upstream: &str) -> Result<(), StageError> {
        self.store.delete(&cursor_key(consumer, upstream))?;
        Ok(())
    }
}

/// Dependency-first order over the stage specs, erroring on cycles.
fn topological_order(specs: &[StageSpec], source: &str) -> Result<Vec<String>, GraphError> {
    fn visit(
        name: &str,
        by_name: &HashMap<&str, &StageSpec>,
        source: &str,
        visited: &mut HashSet<String>,
        in_progress: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<(), GraphError> {
        if visited.contains(name) {
            return Ok(());
        }
        if !in_progress.insert(name.to_string()) {
            return Err(GraphError::Cycle(name.to_string()));
        }
        if let Some(spec) = by_name.get(name) {
            for up in &spec.upstreams {
                if up != source {
                    visit(up, by_name, source, visited, in_progress, order)?;
                }
            }
        }
        in_progress.remove(name);
        visited.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }

    let by_name: HashMap<&str, &StageSpec> = specs.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut visited = HashSet::new();
    let mut in_progress = HashSet::new();
    let mut order = Vec::new();
    for spec in specs {
        visit(
            &spec.name,
            &by_name,
            source,
            &mut visited,
            &mut in_progress,
            &mut order,
        )?;
    }
    Ok(order)
}

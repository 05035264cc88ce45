//! Tidemill Runtime - Incremental pipeline execution engine
//!
//! This crate provides the stage graph, constraint gating, CDC merge, and
//! aggregate maintenance behind a tidemill pipeline.

pub mod aggregate;
pub mod connector;
pub mod evaluator;
pub mod graph;
pub mod merge;
pub mod metrics;
pub mod ops;
pub mod pipeline;
pub mod quarantine;
pub mod record;
pub mod store;

pub use aggregate::{
    AggKind, AggregateError, AggregateMaintainer, AggregateSpec, MaterializedView, ViewError,
    ViewSpec,
};
pub use connector::{
    ConnectorError, DirectorySource, ReadOptions, SourceConnector, SourceFormat, StaticSource,
};
pub use evaluator::{ConstraintEvaluator, RouteMode, Verdict};
pub use graph::{GraphError, StageError, StageGraph, StageSpec};
pub use merge::{CurrentStateTable, MergeReport, StateSnapshot};
pub use metrics::{Metrics, MetricsServer};
pub use ops::{apply_ops, output_schema, ArithOp, RowOp};
pub use pipeline::{CycleSummary, Pipeline, PipelineError};
pub use quarantine::QuarantineWriter;
pub use record::{FxIndexMap, Record, SharedRecord};
pub use store::{FileStore, MemoryStore, StateStore, StoreError};

//! Tidemill CLI library - testable configuration loading and pipeline assembly
//!
//! The binary stays thin: everything that can be exercised from tests lives
//! here, so a configuration can be validated and assembled without a running
//! process.

pub mod config;

use anyhow::{Context, Result};
use std::sync::Arc;
use tidemill_core::Schema;
use tidemill_runtime::{
    AggregateMaintainer, CurrentStateTable, DirectorySource, FileStore, MemoryStore, Metrics,
    Pipeline, QuarantineWriter, StageGraph, StateStore,
};

use config::{PipelineConfig, StoreKind};

/// What `check` reports about a validated pipeline.
#[derive(Debug, Clone)]
pub struct CheckReport {
    /// Source connector name.
    pub source: String,
    /// Stage names in execution order, quarantine twins included.
    pub execution_order: Vec<String>,
    /// Merge input stage.
    pub merge_input: String,
    /// Configured view names.
    pub views: Vec<String>,
}

/// Assemble the full pipeline described by a configuration.
///
/// Construction is where structural problems surface: unknown upstreams,
/// cycles, constraints on missing fields, views over missing columns. No
/// rows are processed.
pub fn build_pipeline(config: &PipelineConfig, metrics: Option<Metrics>) -> Result<Pipeline> {
    if config.schema.is_empty() {
        anyhow::bail!("config declares no source schema");
    }
    if config.stages.is_empty() {
        anyhow::bail!("config declares no stages");
    }
    if config.merge.input.is_empty() {
        anyhow::bail!("merge block declares no input stage");
    }
    if config.merge.keys.is_empty() {
        anyhow::bail!("merge block declares no key fields");
    }
    if config.merge.sequence.is_empty() {
        anyhow::bail!("merge block declares no sequence field");
    }

    let store: Arc<dyn StateStore> = match config.store.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::File => Arc::new(
            FileStore::new(&config.store.path)
                .with_context(|| format!("opening state store {}", config.store.path.display()))?,
        ),
    };

    let schema = Schema::new(config.schema.clone());
    let source = DirectorySource::new(
        config.source.name.clone(),
        config.source.path.clone(),
        config.source.format,
        schema.clone(),
        config.source.read_options(),
        Arc::clone(&store),
    );

    let mut graph = StageGraph::new(
        Box::new(source),
        schema,
        config.stages.clone(),
        Arc::clone(&store),
    )
    .context("building the stage graph")?;
    if let Some(path) = &config.quarantine {
        let writer = QuarantineWriter::new(path)
            .with_context(|| format!("opening quarantine log {}", path.display()))?;
        graph = graph.with_quarantine(writer);
    }
    if let Some(m) = &metrics {
        graph = graph.with_metrics(m.clone());
    }

    let state = CurrentStateTable::new(config.merge.keys.clone(), config.merge.sequence.clone());
    let mut maintainer = AggregateMaintainer::new(config.views.clone());
    if let Some(dir) = &config.export {
        maintainer = maintainer.with_export_dir(dir);
    }

    let mut pipeline = Pipeline::new(graph, state, maintainer, config.merge.input.clone(), store)
        .context("assembling the pipeline")?;
    if let Some(m) = metrics {
        pipeline = pipeline.with_metrics(m);
    }
    Ok(pipeline)
}

/// Validate a configuration end to end without processing any rows.
pub fn check_pipeline(config: &PipelineConfig) -> Result<CheckReport> {
    let pipeline = build_pipeline(config, None)?;
    Ok(CheckReport {
        source: pipeline.graph().source_name().to_string(),
        execution_order: pipeline.graph().execution_order().to_vec(),
        merge_input: pipeline.merge_input().to_string(),
        views: config.views.iter().map(|v| v.name.clone()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{MergeConfig, StoreConfig};
    use std::path::PathBuf;

    /// The example topology, rehomed onto a memory store with no side
    /// effects on the working directory.
    fn example_in_memory() -> PipelineConfig {
        let mut config = PipelineConfig::example();
        config.store = StoreConfig {
            kind: StoreKind::Memory,
            path: PathBuf::from("unused"),
        };
        config.quarantine = None;
        config.export = None;
        config
    }

    #[test]
    fn test_example_config_builds() {
        let report = check_pipeline(&example_in_memory()).unwrap();
        assert_eq!(report.source, "events");
        assert_eq!(
            report.execution_order,
            vec!["events", "bronze", "silver", "silver_quarantine"]
        );
        assert_eq!(report.merge_input, "silver");
        assert_eq!(report.views, vec!["sales_by_country", "top_ten_customers"]);
    }

    #[test]
    fn test_empty_schema_is_rejected() {
        let mut config = example_in_memory();
        config.schema.clear();
        assert!(build_pipeline(&config, None).is_err());
    }

    #[test]
    fn test_empty_merge_keys_are_rejected() {
        let mut config = example_in_memory();
        config.merge = MergeConfig {
            input: "silver".to_string(),
            keys: vec![],
            sequence: "InvoiceDatetime".to_string(),
        };
        assert!(build_pipeline(&config, None).is_err());
    }

    #[test]
    fn test_constraint_on_dropped_field_is_rejected() {
        let mut config = example_in_memory();
        // InvoiceDate is dropped by bronze, so silver cannot gate on it
        config.stages[1].constraints[0].predicate.field = "InvoiceDate".to_string();
        let err = build_pipeline(&config, None).unwrap_err();
        assert!(err.to_string().contains("stage graph"));
    }

    #[test]
    fn test_view_over_missing_column_is_rejected() {
        let mut config = example_in_memory();
        config.views[0].group_by = vec!["Region".to_string()];
        assert!(build_pipeline(&config, None).is_err());
    }
}

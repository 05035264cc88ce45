//! Pipeline configuration for Tidemill
//!
//! Supports both YAML and TOML configuration files.
//!
//! # Example YAML configuration:
//! ```yaml
//! # Tidemill pipeline configuration
//!
//! # Source directory to ingest
//! source:
//!   name: events
//!   path: ./data/incoming
//!   format: csv
//!
//! # Declared schema of raw source rows
//! schema:
//!   - name: InvoiceNo
//!     type: str
//!   - name: Quantity
//!     type: int
//!
//! # Transform stages with row operations and constraints
//! stages:
//!   - name: silver
//!     upstreams: [events]
//!     constraints:
//!       - name: positive_quantity
//!         field: Quantity
//!         op: gt
//!         value: 0
//!
//! # Keyed CDC merge into the current-state table
//! merge:
//!   input: silver
//!   keys: [CustomerID, InvoiceNo]
//!   sequence: InvoiceDatetime
//!
//! # Re-trigger cadence; omit to run continuously
//! trigger: 30 seconds
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tidemill_core::{Constraint, Field, FieldType, Predicate, PredicateOp, Value};
use tidemill_runtime::{
    AggKind, AggregateSpec, ArithOp, ReadOptions, RowOp, SourceFormat, StageSpec, ViewSpec,
};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Re-trigger cadence ("30 seconds", "5 minutes", "1 hour");
    /// absent means run continuously
    pub trigger: Option<String>,

    /// Quarantine log path (JSONL); absent disables the log, rejected rows
    /// are still counted
    pub quarantine: Option<PathBuf>,

    /// Directory for exported view files (JSONL, one per view)
    pub export: Option<PathBuf>,

    /// Source connector configuration
    pub source: SourceConfig,

    /// Declared schema of raw source rows
    pub schema: Vec<Field>,

    /// Transform stages, in any order; dependencies come from `upstreams`
    pub stages: Vec<StageSpec>,

    /// CDC merge configuration
    pub merge: MergeConfig,

    /// Materialized aggregate views over the current-state table
    pub views: Vec<ViewSpec>,

    /// State store configuration
    pub store: StoreConfig,

    /// Metrics endpoint configuration
    pub metrics: MetricsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Source connector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Connector name; also the root node of the stage graph
    pub name: String,

    /// Directory to watch for data files
    pub path: PathBuf,

    /// File format (csv, jsonl)
    pub format: SourceFormat,

    /// CSV field delimiter
    pub delimiter: char,

    /// Whether CSV files carry a header row
    pub has_header: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: "events".to_string(),
            path: PathBuf::from("./data"),
            format: SourceFormat::Csv,
            delimiter: ',',
            has_header: true,
        }
    }
}

impl SourceConfig {
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            delimiter: self.delimiter,
            has_header: self.has_header,
        }
    }
}

/// CDC merge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MergeConfig {
    /// Stage whose output feeds the current-state merge
    pub input: String,

    /// Key fields identifying one logical row
    pub keys: Vec<String>,

    /// Sequence field deciding which version of a row is newest
    pub sequence: String,
}

/// State store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store backend (memory, file)
    pub kind: StoreKind,

    /// Root directory for the file store
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            path: PathBuf::from("./state"),
        }
    }
}

/// Store backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    File,
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus scrape endpoint
    pub enabled: bool,

    /// Bind address
    pub bind: String,

    /// Endpoint port
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

impl MetricsConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Include timestamps
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            timestamps: true,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => {
                // Try YAML first, then TOML
                Self::from_yaml(&content).or_else(|_| Self::from_toml(&content))
            }
        }
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Merge another config into this one (other values take precedence if set)
    pub fn merge(&mut self, other: PipelineConfig) {
        if other.source != SourceConfig::default() {
            self.source = other.source;
        }
        if !other.schema.is_empty() {
            self.schema = other.schema;
        }
        if !other.stages.is_empty() {
            self.stages = other.stages;
        }
        if other.merge != MergeConfig::default() {
            self.merge = other.merge;
        }
        if !other.views.is_empty() {
            self.views = other.views;
        }
        if other.trigger.is_some() {
            self.trigger = other.trigger;
        }
        if other.quarantine.is_some() {
            self.quarantine = other.quarantine;
        }
        if other.store != StoreConfig::default() {
            self.store = other.store;
        }
        if other.metrics != MetricsConfig::default() {
            self.metrics = other.metrics;
        }
        if other.export.is_some() {
            self.export = other.export;
        }
        if other.logging != LoggingConfig::default() {
            self.logging = other.logging;
        }
    }

    /// Create an example configuration: the retail invoice pipeline
    pub fn example() -> Self {
        Self {
            trigger: Some("30 seconds".to_string()),
            quarantine: Some(PathBuf::from("./quarantine/rejected.jsonl")),
            export: Some(PathBuf::from("./gold")),
            source: SourceConfig {
                name: "events".to_string(),
                path: PathBuf::from("./data/incoming"),
                format: SourceFormat::Csv,
                delimiter: ',',
                has_header: true,
            },
            schema: vec![
                Field::new("InvoiceNo", FieldType::Str),
                Field::new("StockCode", FieldType::Str),
                Field::new("Description", FieldType::Str),
                Field::new("Quantity", FieldType::Str),
                Field::new("InvoiceDate", FieldType::Str),
                Field::new("InvoiceTime", FieldType::Str),
                Field::new("UnitPrice", FieldType::Str),
                Field::new("CustomerID", FieldType::Str),
                Field::new("Country", FieldType::Str),
            ],
            stages: vec![
                StageSpec {
                    name: "bronze".to_string(),
                    upstreams: vec!["events".to_string()],
                    ops: vec![
                        RowOp::Trim {
                            field: "Description".to_string(),
                        },
                        RowOp::ToInt {
                            field: "Quantity".to_string(),
                        },
                        RowOp::ToFloat {
                            field: "UnitPrice".to_string(),
                        },
                        RowOp::ParseTimestamp {
                            date_field: "InvoiceDate".to_string(),
                            time_field: Some("InvoiceTime".to_string()),
                            target: "InvoiceDatetime".to_string(),
                        },
                        RowOp::DropField {
                            field: "InvoiceDate".to_string(),
                        },
                        RowOp::DropField {
                            field: "InvoiceTime".to_string(),
                        },
                    ],
                    constraints: vec![],
                    partition_by: None,
                },
                StageSpec {
                    name: "silver".to_string(),
                    upstreams: vec!["bronze".to_string()],
                    ops: vec![RowOp::Compute {
                        target: "TotalPrice".to_string(),
                        left: "Quantity".to_string(),
                        arith: ArithOp::Mul,
                        right: "UnitPrice".to_string(),
                    }],
                    constraints: vec![
                        Constraint::new(
                            "customer_known",
                            Predicate {
                                field: "CustomerID".to_string(),
                                op: PredicateOp::NotNull,
                                value: None,
                            },
                        ),
                        Constraint::new(
                            "positive_quantity",
                            Predicate {
                                field: "Quantity".to_string(),
                                op: PredicateOp::Gt,
                                value: Some(Value::Int(0)),
                            },
                        ),
                        Constraint::new(
                            "valid_datetime",
                            Predicate {
                                field: "InvoiceDatetime".to_string(),
                                op: PredicateOp::NotNull,
                                value: None,
                            },
                        ),
                    ],
                    partition_by: Some("Country".to_string()),
                },
            ],
            merge: MergeConfig {
                input: "silver".to_string(),
                keys: vec!["CustomerID".to_string(), "InvoiceNo".to_string()],
                sequence: "InvoiceDatetime".to_string(),
            },
            views: vec![
                ViewSpec {
                    name: "sales_by_country".to_string(),
                    group_by: vec!["Country".to_string()],
                    aggregates: vec![AggregateSpec {
                        name: "TotalSales".to_string(),
                        agg: AggKind::Sum,
                        field: Some("Quantity".to_string()),
                    }],
                    order_by: None,
                    descending: true,
                    limit: None,
                },
                ViewSpec {
                    name: "top_ten_customers".to_string(),
                    group_by: vec!["CustomerID".to_string()],
                    aggregates: vec![AggregateSpec {
                        name: "Invoices".to_string(),
                        agg: AggKind::CountDistinct,
                        field: Some("InvoiceNo".to_string()),
                    }],
                    order_by: Some("Invoices".to_string()),
                    descending: true,
                    limit: Some(10),
                },
            ],
            store: StoreConfig {
                kind: StoreKind::File,
                path: PathBuf::from("./state"),
            },
            metrics: MetricsConfig {
                enabled: true,
                bind: "127.0.0.1".to_string(),
                port: 9090,
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Generate example YAML configuration
    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::example()).unwrap_or_default()
    }

    /// Generate example TOML configuration
    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

/// Parse a trigger cadence like "30 seconds", "5 minutes" or "1 hour".
pub fn parse_trigger(raw: &str) -> Result<Duration, ConfigError> {
    let mut parts = raw.split_whitespace();
    let (Some(count), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ConfigError::Trigger(raw.to_string()));
    };
    let count: u64 = count
        .parse()
        .map_err(|_| ConfigError::Trigger(raw.to_string()))?;
    if count == 0 {
        return Err(ConfigError::Trigger(raw.to_string()));
    }
    let unit_secs = match unit {
        "second" | "seconds" | "sec" | "secs" | "s" => 1,
        "minute" | "minutes" | "min" | "mins" | "m" => 60,
        "hour" | "hours" | "h" => 3600,
        _ => return Err(ConfigError::Trigger(raw.to_string())),
    };
    Ok(Duration::from_secs(count * unit_secs))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid trigger interval '{0}': expected e.g. \"30 seconds\", \"5 minutes\", \"1 hour\"")]
    Trigger(String),
}

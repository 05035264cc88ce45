//! Tidemill CLI - declarative incremental ETL pipeline driver

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tidemill_cli::config::{parse_trigger, LoggingConfig, PipelineConfig};
use tidemill_cli::{build_pipeline, check_pipeline};
use tidemill_runtime::{
    CycleSummary, Metrics, MetricsServer, Pipeline, PipelineError, StageError,
};

#[derive(Parser)]
#[command(name = "tidemill")]
#[command(author = "Tidemill Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Tidemill - declarative incremental ETL pipelines", long_about = None)]
struct Cli {
    /// Path to the pipeline configuration file (YAML or TOML)
    #[arg(short, long, global = true, env = "TIDEMILL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured pipeline
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,

        /// Override the configured trigger cadence (e.g. "30 seconds")
        #[arg(long)]
        trigger: Option<String>,
    },

    /// Load the configuration and build the pipeline without processing
    Check,

    /// Generate example configuration file
    ConfigGen {
        /// Output format (yaml, toml)
        #[arg(short, long, default_value = "yaml")]
        format: String,

        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { once, trigger } => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(&config.logging)?;
            run(config, once, trigger).await
        }

        Commands::Check => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(&config.logging)?;
            check(&config)
        }

        Commands::ConfigGen { format, output } => config_gen(&format, output.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let path = path.ok_or_else(|| {
        anyhow::anyhow!("no configuration file: pass --config or set TIDEMILL_CONFIG")
    })?;
    PipelineConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let level = match logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => anyhow::bail!("unknown log level '{other}'"),
    };
    let builder = FmtSubscriber::builder().with_max_level(level);
    if logging.timestamps {
        tracing::subscriber::set_global_default(builder.finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.without_time().finish())?;
    }
    Ok(())
}

async fn run(config: PipelineConfig, once: bool, trigger_override: Option<String>) -> Result<()> {
    let metrics = config.metrics.enabled.then(Metrics::new);
    let mut pipeline = build_pipeline(&config, metrics.clone())?;

    if let Some(m) = metrics {
        let server = MetricsServer::new(m, config.metrics.addr());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("metrics server error: {e}");
            }
        });
    }

    if once {
        let summary = pipeline.run_cycle().await?;
        print_summary(&summary);
        print_views(&pipeline);
        return Ok(());
    }

    let cadence = match trigger_override.as_deref().or(config.trigger.as_deref()) {
        Some(raw) => Some(parse_trigger(raw)?),
        None => None,
    };
    match cadence {
        Some(d) => info!(cadence_secs = d.as_secs(), "pipeline started"),
        None => info!("pipeline started, continuous re-trigger"),
    }
    println!("Tidemill running. Press Ctrl+C to stop.\n");

    let mut ticker = cadence.map(tokio::time::interval);
    let mut aggregates_dirty = false;
    loop {
        // Without a cadence the tick resolves immediately: continuous mode
        let tick = async {
            if let Some(t) = ticker.as_mut() {
                t.tick().await;
            }
        };
        tokio::select! {
            _ = tick => {
                if aggregates_dirty {
                    match pipeline.retry_aggregates() {
                        Ok(()) => {
                            aggregates_dirty = false;
                            info!("aggregate views recovered");
                        }
                        Err(e) => warn!("aggregate retry failed: {e}"),
                    }
                }
                match pipeline.run_cycle().await {
                    Ok(summary) => {
                        if summary.ingested > 0 || summary.merge.changed() {
                            print_summary(&summary);
                        }
                    }
                    // State committed before views; retry the maintainer alone
                    Err(PipelineError::Aggregate(e)) => {
                        aggregates_dirty = true;
                        warn!("aggregate refresh failed, retrying next cycle: {e}");
                    }
                    // Source hiccups redeliver on the next poll
                    Err(PipelineError::Stage(StageError::Source(e))) => {
                        warn!("source unavailable, retrying next cycle: {e}");
                    }
                    Err(e) => {
                        error!("cycle failed: {e}");
                        return Err(e.into());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping...");
                break;
            }
        }
    }

    print_views(&pipeline);
    Ok(())
}

fn check(config: &PipelineConfig) -> Result<()> {
    let report = check_pipeline(config)?;
    println!("Configuration OK");
    println!("  source:  {} <- {}", report.source, config.source.path.display());
    println!("  stages:  {}", report.execution_order.join(" -> "));
    println!(
        "  merge:   {} keyed by [{}], sequenced by {}",
        report.merge_input,
        config.merge.keys.join(", "),
        config.merge.sequence
    );
    if report.views.is_empty() {
        println!("  views:   none");
    } else {
        println!("  views:   {}", report.views.join(", "));
    }
    Ok(())
}

fn config_gen(format: &str, output: Option<&Path>) -> Result<()> {
    let content = match format.to_lowercase().as_str() {
        "yaml" | "yml" => PipelineConfig::example_yaml(),
        "toml" => PipelineConfig::example_toml(),
        other => anyhow::bail!("unsupported format: {other}. Use 'yaml' or 'toml'"),
    };

    if let Some(path) = output {
        std::fs::write(path, &content).with_context(|| format!("writing {}", path.display()))?;
        println!("Configuration written to: {}", path.display());
    } else {
        println!("{content}");
    }
    Ok(())
}

fn print_summary(summary: &CycleSummary) {
    println!(
        "cycle: {} ingested | {} merged | {} late discarded | {} state rows",
        summary.ingested,
        summary.merge.inserted + summary.merge.replaced,
        summary.merge.discarded_late,
        summary.merge.state_rows
    );
}

fn print_views(pipeline: &Pipeline) {
    for spec in pipeline.aggregates().specs() {
        if let Some(view) = pipeline.view(&spec.name) {
            println!("\n{} ({} rows)", view.name, view.rows.len());
            for row in &view.rows {
                println!("  {row}");
            }
        }
    }
}

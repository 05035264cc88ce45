//! Prometheus metrics for the pipeline engine.

use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics collection for a running pipeline.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub rows_processed: CounterVec,
    pub rows_quarantined: CounterVec,
    pub constraint_violations: CounterVec,
    pub late_events_discarded: Counter,
    pub null_sequence_anomalies: Counter,
    pub merge_commits: Counter,
    pub state_rows: Gauge,
    pub stage_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let rows_processed = CounterVec::new(
            Opts::new("tidemill_rows_processed", "Rows emitted per stage"),
            &["stage"],
        )
        .expect("failed to create rows_processed counter");

        let rows_quarantined = CounterVec::new(
            Opts::new("tidemill_rows_quarantined", "Rows routed to quarantine per stage"),
            &["stage"],
        )
        .expect("failed to create rows_quarantined counter");

        let constraint_violations = CounterVec::new(
            Opts::new("tidemill_constraint_violations", "Constraint violations by name"),
            &["stage", "constraint"],
        )
        .expect("failed to create constraint_violations counter");

        let late_events_discarded = Counter::new(
            "tidemill_late_events_discarded",
            "Change events discarded for arriving with a stale sequence value",
        )
        .expect("failed to create late_events_discarded counter");

        let null_sequence_anomalies = Counter::new(
            "tidemill_null_sequence_anomalies",
            "Change events discarded for a null or missing key/sequence value",
        )
        .expect("failed to create null_sequence_anomalies counter");

        let merge_commits = Counter::new(
            "tidemill_merge_commits",
            "Current-state merge commits applied",
        )
        .expect("failed to create merge_commits counter");

        let state_rows = Gauge::new(
            "tidemill_state_rows",
            "Rows held in the current-state table",
        )
        .expect("failed to create state_rows gauge");

        let stage_duration = HistogramVec::new(
            HistogramOpts::new("tidemill_stage_duration_seconds", "Stage run duration").buckets(
                vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
            ),
            &["stage"],
        )
        .expect("failed to create stage_duration histogram");

        registry
            .register(Box::new(rows_processed.clone()))
            .expect("failed to register rows_processed");
        registry
            .register(Box::new(rows_quarantined.clone()))
            .expect("failed to register rows_quarantined");
        registry
            .register(Box::new(constraint_violations.clone()))
            .expect("failed to register constraint_violations");
        registry
            .register(Box::new(late_events_discarded.clone()))
            .expect("failed to register late_events_discarded");
        registry
            .register(Box::new(null_sequence_anomalies.clone()))
            .expect("failed to register null_sequence_anomalies");
        registry
            .register(Box::new(merge_commits.clone()))
            .expect("failed to register merge_commits");
        registry
            .register(Box::new(state_rows.clone()))
            .expect("failed to register state_rows");
        registry
            .register(Box::new(stage_duration.clone()))
            .expect("failed to register stage_duration");

        Self {
            registry: Arc::new(registry),
            rows_processed,
            rows_quarantined,
            constraint_violations,
            late_events_discarded,
            null_sequence_anomalies,
            merge_commits,
            state_rows,
            stage_duration,
        }
    }

    /// Record a completed stage run.
    pub fn record_stage_run(&self, stage: &str, emitted: usize, quarantined: usize, secs: f64) {
        self.rows_processed
            .with_label_values(&[stage])
            .inc_by(emitted as f64);
        self.rows_quarantined
            .with_label_values(&[stage])
            .inc_by(quarantined as f64);
        self.stage_duration.with_label_values(&[stage]).observe(secs);
    }

    /// Record one constraint violation.
    pub fn record_violation(&self, stage: &str, constraint: &str) {
        self.constraint_violations
            .with_label_values(&[stage, constraint])
            .inc();
    }

    /// Record the outcome of a merge commit.
    pub fn record_merge(&self, late: u64, null_anomalies: u64, state_rows: usize) {
        self.merge_commits.inc();
        self.late_events_discarded.inc_by(late as f64);
        self.null_sequence_anomalies.inc_by(null_anomalies as f64);
        self.state_rows.set(state_rows as f64);
    }

    /// Get Prometheus text output.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP server for the Prometheus scrape endpoint.
pub struct MetricsServer {
    metrics: Metrics,
    addr: String,
}

impl MetricsServer {
    pub fn new(metrics: Metrics, addr: impl Into<String>) -> Self {
        Self {
            metrics,
            addr: addr.into(),
        }
    }

    /// Run the metrics HTTP server.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Metrics server listening on http://{}/metrics", self.addr);

        loop {
            let (mut socket, _addr) = listener.accept().await?;

            let metrics_output = self.metrics.gather();

            // Simple HTTP response
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics_output.len(),
                metrics_output
            );

            if let Err(e) = socket.write_all(response.as_bytes()).await {
                error!("Failed to write response: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_gather() {
        let metrics = Metrics::new();
        metrics.record_stage_run("silver_cleaned", 10, 2, 0.003);
        metrics.record_violation("silver_cleaned", "valid_customer");
        metrics.record_merge(1, 0, 8);

        let output = metrics.gather();
        assert!(output.contains("tidemill_rows_processed"));
        assert!(output.contains("tidemill_constraint_violations"));
        assert!(output.contains("tidemill_late_events_discarded"));
        assert!(output.contains("tidemill_state_rows"));
    }

    #[test]
    fn test_merge_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_merge(2, 1, 5);
        metrics.record_merge(3, 0, 6);
        assert_eq!(metrics.late_events_discarded.get(), 5.0);
        assert_eq!(metrics.null_sequence_anomalies.get(), 1.0);
        assert_eq!(metrics.merge_commits.get(), 2.0);
        assert_eq!(metrics.state_rows.get(), 6.0);
    }
}

//! Metrics registry and text exporters
//!
//! One [`SandcastleMetrics`] is built by the composition root and shared
//! (via `Arc`) with every component that reports into it. Two line-oriented
//! export formats are supported: Prometheus exposition text and StatsD lines
//! with DogStatsD-style tags.

use prometheus::proto::{LabelPair, MetricType};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::fmt::Write as _;
use std::time::Duration;

use crate::config::MetricsFormat;
use crate::error::{ObservabilityError, Result};

/// Sandcastle metrics collection
pub struct SandcastleMetrics {
    registry: Registry,

    // Rate limiter
    /// In-flight upstream calls per provider
    pub rate_limit_active: IntGaugeVec,
    /// Callers waiting for a slot per provider
    pub rate_limit_queued: IntGaugeVec,
    /// Admitted calls per provider
    pub rate_limit_accepted_total: IntCounterVec,
    /// Rejected or timed-out calls per provider
    pub rate_limit_rejected_total: IntCounterVec,
    /// Calls that released their slot per provider
    pub rate_limit_completed_total: IntCounterVec,
    /// Time spent waiting for admission
    pub rate_limit_wait_seconds: HistogramVec,

    // Ports
    /// Ports currently held by reservations
    pub port_reservations: IntGauge,

    // Connection pool
    /// Pooled connections by state (idle, in_flight)
    pub pool_connections: IntGaugeVec,

    // Sandbox lifecycle
    /// Status transitions observed from the container runtime
    pub sandbox_status_changes_total: IntCounterVec,
}

impl std::fmt::Debug for SandcastleMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandcastleMetrics").finish_non_exhaustive()
    }
}

fn init_err(e: prometheus::Error) -> ObservabilityError {
    ObservabilityError::MetricsInit(e.to_string())
}

impl SandcastleMetrics {
    /// Create and register every metric in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let rate_limit_active = IntGaugeVec::new(
            Opts::new(
                "sandcastle_rate_limit_active",
                "In-flight upstream model calls per provider",
            ),
            &["provider"],
        )
        .map_err(init_err)?;

        let rate_limit_queued = IntGaugeVec::new(
            Opts::new(
                "sandcastle_rate_limit_queued",
                "Callers waiting for an upstream call slot per provider",
            ),
            &["provider"],
        )
        .map_err(init_err)?;

        let rate_limit_accepted_total = IntCounterVec::new(
            Opts::new(
                "sandcastle_rate_limit_accepted_total",
                "Upstream calls admitted per provider",
            ),
            &["provider"],
        )
        .map_err(init_err)?;

        let rate_limit_rejected_total = IntCounterVec::new(
            Opts::new(
                "sandcastle_rate_limit_rejected_total",
                "Upstream calls rejected or timed out per provider",
            ),
            &["provider"],
        )
        .map_err(init_err)?;

        let rate_limit_completed_total = IntCounterVec::new(
            Opts::new(
                "sandcastle_rate_limit_completed_total",
                "Upstream calls that released their slot per provider",
            ),
            &["provider"],
        )
        .map_err(init_err)?;

        let rate_limit_wait_seconds = HistogramVec::new(
            HistogramOpts::new(
                "sandcastle_rate_limit_wait_seconds",
                "Time spent waiting for an upstream call slot",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0]),
            &["provider"],
        )
        .map_err(init_err)?;

        let port_reservations = IntGauge::new(
            "sandcastle_port_reservations",
            "Host ports currently held by reservations",
        )
        .map_err(init_err)?;

        let pool_connections = IntGaugeVec::new(
            Opts::new(
                "sandcastle_pool_connections",
                "Pooled control-channel connections by state",
            ),
            &["state"],
        )
        .map_err(init_err)?;

        let sandbox_status_changes_total = IntCounterVec::new(
            Opts::new(
                "sandcastle_sandbox_status_changes_total",
                "Sandbox status transitions observed from the container runtime",
            ),
            &["status"],
        )
        .map_err(init_err)?;

        registry
            .register(Box::new(rate_limit_active.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(rate_limit_queued.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(rate_limit_accepted_total.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(rate_limit_rejected_total.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(rate_limit_completed_total.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(rate_limit_wait_seconds.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(port_reservations.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(pool_connections.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(sandbox_status_changes_total.clone()))
            .map_err(init_err)?;

        Ok(Self {
            registry,
            rate_limit_active,
            rate_limit_queued,
            rate_limit_accepted_total,
            rate_limit_rejected_total,
            rate_limit_completed_total,
            rate_limit_wait_seconds,
            port_reservations,
            pool_connections,
            sandbox_status_changes_total,
        })
    }

    /// Get the underlying Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an admitted upstream call and how long it waited
    pub fn record_admission(&self, provider: &str, waited: Duration) {
        self.rate_limit_accepted_total
            .with_label_values(&[provider])
            .inc();
        self.rate_limit_wait_seconds
            .with_label_values(&[provider])
            .observe(waited.as_secs_f64());
    }

    /// Record a rejected or timed-out upstream call
    pub fn record_rejection(&self, provider: &str) {
        self.rate_limit_rejected_total
            .with_label_values(&[provider])
            .inc();
    }

    /// Record an upstream call releasing its slot
    pub fn record_completion(&self, provider: &str) {
        self.rate_limit_completed_total
            .with_label_values(&[provider])
            .inc();
    }

    /// Mirror the live active/queued counts of a provider
    pub fn set_rate_limit_load(&self, provider: &str, active: usize, queued: usize) {
        self.rate_limit_active
            .with_label_values(&[provider])
            .set(active as i64);
        self.rate_limit_queued
            .with_label_values(&[provider])
            .set(queued as i64);
    }

    /// Mirror the number of reserved host ports
    pub fn set_port_reservations(&self, ports: usize) {
        self.port_reservations.set(ports as i64);
    }

    /// Mirror the connection pool occupancy
    pub fn set_pool_connections(&self, idle: usize, in_flight: usize) {
        self.pool_connections
            .with_label_values(&["idle"])
            .set(idle as i64);
        self.pool_connections
            .with_label_values(&["in_flight"])
            .set(in_flight as i64);
    }

    /// Count a sandbox status transition
    pub fn record_status_change(&self, status: &str) {
        self.sandbox_status_changes_total
            .with_label_values(&[status])
            .inc();
    }

    /// Encode in the requested format
    pub fn encode(&self, format: MetricsFormat) -> Result<String> {
        match format {
            MetricsFormat::Prometheus => self.encode_prometheus(),
            MetricsFormat::Statsd => Ok(self.encode_statsd()),
        }
    }

    /// Encode metrics in Prometheus text format
    pub fn encode_prometheus(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| ObservabilityError::Encode(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| ObservabilityError::Encode(e.to_string()))
    }

    /// Encode metrics as StatsD lines: `name:value|type|#tag:value,...`
    ///
    /// Counters use `c`, gauges `g`. Histograms are flattened into a timing
    /// line for the sum (milliseconds) and a counter line for the count.
    pub fn encode_statsd(&self) -> String {
        let mut out = String::new();

        for family in self.registry.gather() {
            let name = family.get_name();
            for metric in family.get_metric() {
                let tags = format_tags(metric.get_label());
                match family.get_field_type() {
                    MetricType::COUNTER => {
                        push_statsd_line(
                            &mut out,
                            name,
                            metric.get_counter().get_value(),
                            "c",
                            &tags,
                        );
                    }
                    MetricType::GAUGE => {
                        push_statsd_line(&mut out, name, metric.get_gauge().get_value(), "g", &tags);
                    }
                    MetricType::HISTOGRAM => {
                        let histogram = metric.get_histogram();
                        let base = name.strip_suffix("_seconds").unwrap_or(name);
                        push_statsd_line(
                            &mut out,
                            &format!("{base}.sum"),
                            histogram.get_sample_sum() * 1000.0,
                            "ms",
                            &tags,
                        );
                        push_statsd_line(
                            &mut out,
                            &format!("{base}.count"),
                            histogram.get_sample_count() as f64,
                            "c",
                            &tags,
                        );
                    }
                    _ => {}
                }
            }
        }

        out
    }
}

fn format_tags(labels: &[LabelPair]) -> String {
    labels
        .iter()
        .map(|l| format!("{}:{}", l.get_name(), l.get_value()))
        .collect::<Vec<_>>()
        .join(",")
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn push_statsd_line(out: &mut String, name: &str, value: f64, kind: &str, tags: &str) {
    let _ = write!(out, "{name}:{}|{kind}", format_value(value));
    if !tags.is_empty() {
        let _ = write!(out, "|#{tags}");
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_export() {
        let metrics = SandcastleMetrics::new().unwrap();
        metrics.record_admission("anthropic", Duration::from_millis(20));
        metrics.record_rejection("anthropic");
        metrics.set_port_reservations(6);

        let encoded = metrics.encode_prometheus().unwrap();
        assert!(encoded.contains("# HELP sandcastle_rate_limit_accepted_total"));
        assert!(encoded.contains("# TYPE sandcastle_rate_limit_accepted_total counter"));
        assert!(encoded.contains("sandcastle_rate_limit_accepted_total{provider=\"anthropic\"} 1"));
        assert!(encoded.contains("sandcastle_rate_limit_rejected_total{provider=\"anthropic\"} 1"));
        assert!(encoded.contains("sandcastle_port_reservations 6"));
        assert!(encoded.contains("sandcastle_rate_limit_wait_seconds_bucket"));
        assert!(encoded.contains("sandcastle_rate_limit_wait_seconds_sum"));
        assert!(encoded.contains("sandcastle_rate_limit_wait_seconds_count{provider=\"anthropic\"} 1"));
    }

    #[test]
    fn test_statsd_export() {
        let metrics = SandcastleMetrics::new().unwrap();
        metrics.record_completion("openai");
        metrics.record_completion("openai");
        metrics.set_pool_connections(3, 1);
        metrics.record_admission("openai", Duration::from_millis(250));

        let encoded = metrics.encode_statsd();
        assert!(encoded.contains("sandcastle_rate_limit_completed_total:2|c|#provider:openai\n"));
        assert!(encoded.contains("sandcastle_pool_connections:3|g|#state:idle\n"));
        assert!(encoded.contains("sandcastle_pool_connections:1|g|#state:in_flight\n"));
        assert!(encoded.contains("sandcastle_rate_limit_wait.sum:250|ms|#provider:openai\n"));
        assert!(encoded.contains("sandcastle_rate_limit_wait.count:1|c|#provider:openai\n"));
    }

    #[test]
    fn test_statsd_untagged_gauge() {
        let metrics = SandcastleMetrics::new().unwrap();
        metrics.set_port_reservations(9);

        let encoded = metrics.encode(MetricsFormat::Statsd).unwrap();
        assert!(encoded.lines().any(|l| l == "sandcastle_port_reservations:9|g"));
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(3.0), "3");
        assert_eq!(format_value(0.5), "0.5");
    }

    #[test]
    fn test_isolated_instances() {
        let a = SandcastleMetrics::new().unwrap();
        let b = SandcastleMetrics::new().unwrap();
        a.record_status_change("running");

        assert!(a.encode_statsd().contains("status:running"));
        assert!(!b.encode_statsd().contains("status:running"));
    }
}

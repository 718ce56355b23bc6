//! Sandcastle Observability - Logging and Metrics
//!
//! - Structured logging with pretty/JSON/compact console formats and rotating files
//! - A metrics registry exportable as Prometheus text or StatsD lines
//!
//! # Quick Start
//!
//! ```no_run
//! use sandcastle_observability::{init_observability, ObservabilityConfig};
//!
//! let config = ObservabilityConfig::default();
//! let (_guard, metrics) = init_observability(&config).expect("observability");
//!
//! tracing::info!("control plane started");
//! println!("{}", metrics.encode_prometheus().unwrap());
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::*;
pub use error::{ObservabilityError, Result};
pub use logging::{init_logging, LogGuard};
pub use metrics::SandcastleMetrics;

use std::sync::Arc;

/// Initialize logging and build the metrics registry
///
/// The returned guard must be held for the lifetime of the process. The
/// metrics handle is meant to be injected into the components that report
/// into it.
pub fn init_observability(config: &ObservabilityConfig) -> Result<(LogGuard, Arc<SandcastleMetrics>)> {
    let guard = init_logging(&config.logging)?;
    let metrics = Arc::new(SandcastleMetrics::new()?);

    if !config.metrics.enabled {
        tracing::info!("Metrics disabled by configuration, components will not report");
    }

    tracing::debug!(format = ?config.metrics.format, "Observability initialized");
    Ok((guard, metrics))
}

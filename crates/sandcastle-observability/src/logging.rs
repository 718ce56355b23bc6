//! Structured logging with pretty/JSON/compact console output and file rotation

use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LoggingConfig, RotationStrategy};
use crate::error::{ObservabilityError, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Guard that must be held to keep the async file writer running
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

impl std::fmt::Debug for LogGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogGuard")
            .field("file_writer", &self._guard.is_some())
            .finish()
    }
}

/// Initialize logging with the given configuration
///
/// `RUST_LOG` wins over the configured level and directives. Returns a guard
/// that must be held for the lifetime of the process so buffered file output
/// is flushed on exit.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let env_filter = build_filter(config);

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];

    let guard = match &config.file {
        Some(file_config) => {
            let (writer, guard) = create_file_writer(file_config);
            layers.push(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(config.include_target)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_ansi(false)
                    .json()
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| ObservabilityError::LoggingInit(e.to_string()))?;

    Ok(LogGuard { _guard: guard })
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| match &config.filter_directives {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::new(config.level.as_directive()),
    })
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    let base = fmt::layer()
        .with_writer(io::stdout)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    match config.format {
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Json => base.json().boxed(),
        LogFormat::Compact => base.compact().boxed(),
    }
}

fn create_file_writer(
    config: &FileLoggingConfig,
) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let appender = match config.rotation {
        RotationStrategy::Daily => tracing_appender::rolling::daily(&config.directory, &config.prefix),
        RotationStrategy::Hourly => {
            tracing_appender::rolling::hourly(&config.directory, &config.prefix)
        }
        RotationStrategy::Never => tracing_appender::rolling::never(&config.directory, &config.prefix),
    };

    tracing_appender::non_blocking(appender)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_directives_override_level() {
        let config = LoggingConfig {
            level: LogLevel::Error,
            filter_directives: Some("sandcastle_agent=trace".to_string()),
            ..Default::default()
        };

        // RUST_LOG is not set under `cargo test` unless the caller exports it
        if std::env::var("RUST_LOG").is_err() {
            let filter = build_filter(&config);
            assert!(filter.to_string().contains("sandcastle_agent=trace"));
        }
    }

    #[test]
    fn test_log_guard_debug() {
        let guard = LogGuard { _guard: None };
        assert!(format!("{:?}", guard).contains("file_writer: false"));
    }
}

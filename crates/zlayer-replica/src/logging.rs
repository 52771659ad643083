//! Structured logging setup for embedding applications
//!
//! Console output in pretty, JSON or compact form, plus optional rotating
//! JSON log files written through a non-blocking appender.

use std::io;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogLevel, LoggingConfig, RotationStrategy};
use crate::error::{ReplicaError, Result};

type Filtered = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Filtered> + Send + Sync>;

/// Keeps the background log file writer alive; drop it last.
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

impl LogGuard {
    fn new(guard: Option<WorkerGuard>) -> Self {
        Self { _guard: guard }
    }
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` wins over the configured level and directives. Fails if a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        match &config.filter_directives {
            Some(directives) => EnvFilter::new(directives),
            None => EnvFilter::new(level_to_string(config.level)),
        }
    });

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];

    let guard = match &config.file {
        Some(file_config) => {
            let (writer, guard) = create_file_writer(file_config)?;
            layers.push(file_layer(config, writer));
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .map_err(|e| ReplicaError::Logging(e.to_string()))?;

    Ok(LogGuard::new(guard))
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    let layer = fmt::layer()
        .with_writer(io::stdout)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

/// Log files are always JSON so they can be shipped to an aggregator.
fn file_layer(config: &LoggingConfig, writer: NonBlocking) -> BoxedLayer {
    fmt::layer()
        .with_writer(writer)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json()
        .boxed()
}

fn level_to_string(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn create_file_writer(config: &FileLoggingConfig) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(&config.directory)?;
    let file_appender = match config.rotation {
        RotationStrategy::Daily => tracing_appender::rolling::daily(&config.directory, &config.prefix),
        RotationStrategy::Hourly => {
            tracing_appender::rolling::hourly(&config.directory, &config.prefix)
        }
        RotationStrategy::Never => tracing_appender::rolling::never(&config.directory, &config.prefix),
    };
    Ok(tracing_appender::non_blocking(file_appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(level_to_string(LogLevel::Info), "info");
        assert_eq!(level_to_string(LogLevel::Debug), "debug");
        assert_eq!(level_to_string(LogLevel::Trace), "trace");
        assert_eq!(level_to_string(LogLevel::Warn), "warn");
        assert_eq!(level_to_string(LogLevel::Error), "error");
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = FileLoggingConfig {
            directory: dir.path().join("logs"),
            prefix: "replica".to_string(),
            rotation: RotationStrategy::Never,
        };
        let (_writer, _guard) = create_file_writer(&config).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }
}

//! Tracing initialization with configurable logging formats.

use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingConfig, ObservabilityConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber: one console layer in the configured
/// format, filtered by `RUST_LOG` or the configured directives.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<TracingGuard, TracingError> {
    let logging = &config.logging;

    tracing_subscriber::registry()
        .with(console_layer(logging))
        .with(build_env_filter(logging))
        .try_init()
        .map_err(|e| TracingError::Init(e.to_string()))?;

    Ok(TracingGuard { _private: () })
}

fn console_layer(logging: &LoggingConfig) -> BoxedLayer {
    let base = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(logging.file_line)
        .with_line_number(logging.file_line);

    match (&logging.format, logging.timestamps) {
        (LogFormat::Pretty, true) => base.pretty().boxed(),
        (LogFormat::Pretty, false) => base.pretty().without_time().boxed(),
        (LogFormat::Compact, true) => base.compact().boxed(),
        (LogFormat::Compact, false) => base.compact().without_time().boxed(),
        (LogFormat::Json, true) => base.json().with_current_span(true).boxed(),
        (LogFormat::Json, false) => base
            .json()
            .with_current_span(true)
            .without_time()
            .boxed(),
    }
}

/// `RUST_LOG` wins over the config file. Unparseable directives fall back
/// to the bare level.
fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| config.directives());
    EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("Ignoring invalid log filter {directives:?}: {e}");
        EnvFilter::new(config.level.as_str())
    })
}

/// Returned by [`init_tracing`]; hold it for the lifetime of the process.
pub struct TracingGuard {
    _private: (),
}

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_config_filter_is_combined_with_level() {
        temp_env::with_var_unset("RUST_LOG", || {
            let config = LoggingConfig {
                level: LogLevel::Debug,
                filter: Some("meterline::services=trace".into()),
                ..Default::default()
            };
            let filter = build_env_filter(&config).to_string();
            assert!(filter.contains("meterline::services=trace"));
            assert!(filter.contains("debug"));
        });
    }

    #[test]
    fn test_rust_log_wins() {
        temp_env::with_var("RUST_LOG", Some("warn"), || {
            let config = LoggingConfig {
                filter: Some("meterline=trace".into()),
                ..Default::default()
            };
            assert_eq!(build_env_filter(&config).to_string(), "warn");
        });
    }

    #[test]
    fn test_invalid_filter_falls_back_to_level() {
        temp_env::with_var_unset("RUST_LOG", || {
            let config = LoggingConfig {
                level: LogLevel::Error,
                filter: Some("meterline=loud".into()),
                ..Default::default()
            };
            assert_eq!(build_env_filter(&config).to_string(), "error");
        });
    }

    #[rstest]
    #[case(LogFormat::Pretty, true)]
    #[case(LogFormat::Pretty, false)]
    #[case(LogFormat::Compact, true)]
    #[case(LogFormat::Compact, false)]
    #[case(LogFormat::Json, true)]
    #[case(LogFormat::Json, false)]
    fn test_console_layer_for_every_format(#[case] format: LogFormat, #[case] timestamps: bool) {
        let config = LoggingConfig {
            format,
            timestamps,
            ..Default::default()
        };
        let _layer = console_layer(&config);
    }
}

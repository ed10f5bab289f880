use serde::{Deserialize, Serialize};

use super::ConfigError;

/// `[observability]`: console logging and the Prometheus recorder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl ObservabilityConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        self.metrics.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Level for every target not named in `filter`.
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    /// Prefix each line with a timestamp. Turn off when the log collector
    /// stamps lines itself.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include source file and line.
    #[serde(default)]
    pub file_line: bool,

    /// Extra directives, e.g. `"meterline::services=debug,sqlx=info"`.
    /// Replaces the default `sqlx=warn`.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            timestamps: true,
            file_line: false,
            filter: None,
        }
    }
}

impl LoggingConfig {
    /// Filter directives for this config, used when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        match &self.filter {
            Some(filter) if !filter.trim().is_empty() => {
                format!("{},{}", self.level.as_str(), filter.trim())
            }
            // sqlx logs every statement at info
            _ => format!("{},sqlx=warn", self.level.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line, for local runs.
    Pretty,
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Prometheus recorder settings. Ignored unless built with `prometheus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Buckets for `meter_usage_tokens` (tokens per recorded report).
    #[serde(default = "default_token_buckets")]
    pub token_buckets: Vec<f64>,

    /// Buckets for `meter_compaction_rows` (rows folded per compaction).
    #[serde(default = "default_row_buckets")]
    pub row_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_buckets: default_token_buckets(),
            row_buckets: default_row_buckets(),
        }
    }
}

impl MetricsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, buckets) in [
            ("token_buckets", &self.token_buckets),
            ("row_buckets", &self.row_buckets),
        ] {
            if buckets.is_empty() || buckets.windows(2).any(|w| w[0] >= w[1]) {
                return Err(ConfigError::Validation(format!(
                    "observability.metrics.{name} must be non-empty and strictly increasing"
                )));
            }
        }
        Ok(())
    }
}

fn default_token_buckets() -> Vec<f64> {
    vec![
        10.0, 100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0,
    ]
}

fn default_row_buckets() -> Vec<f64> {
    vec![1.0, 10.0, 100.0, 1_000.0, 10_000.0]
}

fn default_true() -> bool {
    true
}

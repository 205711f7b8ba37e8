//! Logging setup for the bridge daemon.
//!
//! The `[logging]` level applies to this crate only; dependencies stay at
//! `warn` unless RUST_LOG says otherwise.

use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Logging configuration from config.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
    /// Output format: pretty, compact, json
    pub format: String,
}

impl LogConfig {
    /// Creates a new LogConfig with default values.
    pub fn new() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }

    pub(crate) fn is_known_level(&self) -> bool {
        matches!(
            self.level.to_lowercase().as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        )
    }

    pub(crate) fn is_known_format(&self) -> bool {
        matches!(self.format.as_str(), "pretty" | "compact" | "json")
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes the logging system.
///
/// Priority:
/// 1. RUST_LOG environment variable (if set)
/// 2. `[logging]` section (if provided)
/// 3. Default: info level, pretty format
///
/// Calling this more than once keeps the first subscriber.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("RUST_LOG", "nfbridge=debug");
/// init_logging(None);
///
/// let config = LogConfig { level: "debug".into(), format: "json".into() };
/// init_logging(Some(&config));
/// ```
pub fn init_logging(config: Option<&LogConfig>) {
    let env_filter = build_filter(config);
    let format = config.map(|c| c.format.as_str()).unwrap_or("pretty");

    let result = match format {
        "json" => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::CLOSE),
            ),
        ),
        "compact" => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact()),
        ),
        _ => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_thread_names(true)),
        ),
    };

    if result.is_err() {
        tracing::debug!("logging already initialized, keeping existing subscriber");
    }
}

fn build_filter(config: Option<&LogConfig>) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let level = config
        .map(|cfg| parse_level(&cfg.level))
        .unwrap_or(Level::INFO);
    EnvFilter::new(crate_directive(level))
}

fn crate_directive(level: Level) -> String {
    format!("warn,{}={}", env!("CARGO_CRATE_NAME"), level.as_str().to_lowercase())
}

/// Parses a log level string into a Level.
fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("info"), Level::INFO);
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("INFO"), Level::INFO);
        assert_eq!(parse_level("unknown"), Level::INFO);
    }

    #[test]
    fn test_crate_directive() {
        assert_eq!(crate_directive(Level::DEBUG), "warn,nfbridge=debug");
        assert_eq!(crate_directive(Level::ERROR), "warn,nfbridge=error");
    }

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
        assert!(config.is_known_level());
        assert!(config.is_known_format());
    }

    #[test]
    fn test_log_config_unknown_values() {
        let config = LogConfig {
            level: "loud".into(),
            format: "xml".into(),
        };
        assert!(!config.is_known_level());
        assert!(!config.is_known_format());
    }
}

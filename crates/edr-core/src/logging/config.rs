//! Logging configuration.
//!
//! Level and format come from `EDR_LOG` / `EDR_LOG_FORMAT`, overridden by
//! `-v`/`-q` and `--log-format`. A `RUST_LOG` directive string bypasses the
//! level entirely (see [`super::init_logging`]).

use clap::ValueEnum;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable console lines.
    #[default]
    Human,
    /// One JSON object per line, for service managers.
    #[value(alias = "json")]
    Jsonl,
}

/// Log level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[value(alias = "warning")]
    Warn,
    Error,
    Off,
}

impl LogLevel {
    /// Directive spelling used in filter strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: LogLevel,
}

impl LogConfig {
    /// Environment settings with CLI overrides applied on top.
    pub fn from_env(cli_level: Option<LogLevel>, cli_format: Option<LogFormat>) -> Self {
        Self::resolve(
            std::env::var("EDR_LOG").ok().as_deref(),
            std::env::var("EDR_LOG_FORMAT").ok().as_deref(),
            cli_level,
            cli_format,
        )
    }

    fn resolve(
        env_level: Option<&str>,
        env_format: Option<&str>,
        cli_level: Option<LogLevel>,
        cli_format: Option<LogFormat>,
    ) -> Self {
        // Unparseable environment values are ignored.
        let level = cli_level
            .or_else(|| env_level.and_then(|v| LogLevel::from_str(v.trim(), true).ok()))
            .unwrap_or_default();
        let format = cli_format
            .or_else(|| env_format.and_then(|v| LogFormat::from_str(v.trim(), true).ok()))
            .unwrap_or_default();
        LogConfig { format, level }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_values_parse_case_insensitively() {
        let config = LogConfig::resolve(Some("WARNING"), Some("json"), None, None);
        assert_eq!(config.level, LogLevel::Warn);
        assert_eq!(config.format, LogFormat::Jsonl);
    }

    #[test]
    fn test_garbage_env_falls_back_to_defaults() {
        assert_eq!(
            LogConfig::resolve(Some("loud"), Some("yaml"), None, None),
            LogConfig::default()
        );
    }

    #[test]
    fn test_cli_overrides_env() {
        let config = LogConfig::resolve(
            Some("error"),
            Some("human"),
            Some(LogLevel::Trace),
            Some(LogFormat::Jsonl),
        );
        assert_eq!(config.level, LogLevel::Trace);
        assert_eq!(config.format, LogFormat::Jsonl);
    }
}

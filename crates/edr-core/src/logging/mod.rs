//! Structured logging for the agent.
//!
//! - Human-readable console output for interactive use
//! - JSON lines for running under a service manager
//!
//! stdout is reserved for command payloads; all log output goes to stderr.
//! Log lines carry an `event` field from [`event_names`] and a [`Stage`] so
//! they can be filtered without parsing messages.

pub mod config;
pub mod events;

pub use config::{LogConfig, LogFormat, LogLevel};
pub use events::{event_names, Stage};

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose output the default filter admits.
const AGENT_TARGETS: [&str; 4] = ["edr_core", "edr_spool", "edr_config", "edr_agent"];

fn default_filter(level: LogLevel) -> EnvFilter {
    let directives = AGENT_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level.as_str()))
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::new(directives)
}

/// Initialize the logging subsystem.
///
/// Must be called once at startup before any logging occurs. A `RUST_LOG`
/// directive string, when set and valid, replaces the default filter.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config.level));

    match config.format {
        LogFormat::Human => {
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_names(true)
                .with_ansi(std::io::stderr().is_terminal());
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .init();
        }
        LogFormat::Jsonl => {
            let json_layer = fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_span_list(false)
                .with_thread_names(true)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .init();
        }
    }
}

/// Truncate a potentially long string (command lines, paths) for log output.
pub fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &s[..end])
}

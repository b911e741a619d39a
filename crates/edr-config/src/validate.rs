//! Configuration validation errors and semantic validation.

use thiserror::Error;

use crate::settings::AgentConfig;

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

impl ValidationError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::IoError(_) => 60,
            ValidationError::ParseError(_) => 61,
            ValidationError::InvalidValue { .. } => 65,
            ValidationError::VersionMismatch { .. } => 66,
        }
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

fn require_positive(field: &str, value: u64) -> ValidationResult<()> {
    if value == 0 {
        return Err(invalid(field, "Must be greater than 0"));
    }
    Ok(())
}

/// Validate an agent configuration semantically.
pub fn validate_config(config: &AgentConfig) -> ValidationResult<()> {
    if config.schema_version != crate::CONFIG_SCHEMA_VERSION {
        return Err(ValidationError::VersionMismatch {
            expected: crate::CONFIG_SCHEMA_VERSION.to_string(),
            actual: config.schema_version.clone(),
        });
    }

    let collector = &config.collector;
    if collector.host.trim().is_empty() {
        return Err(invalid("collector.host", "Must not be empty"));
    }
    if collector.port == 0 {
        return Err(invalid("collector.port", "Must be in 1..=65535"));
    }
    require_positive("collector.connect_timeout_ms", collector.connect_timeout_ms)?;
    require_positive("collector.io_timeout_ms", collector.io_timeout_ms)?;
    require_positive(
        "collector.reconnect_interval_secs",
        collector.reconnect_interval_secs,
    )?;
    if collector.max_retries == 0 {
        return Err(invalid("collector.max_retries", "Must be at least 1"));
    }

    let probes = &config.probes;
    require_positive("probes.process_interval_secs", probes.process_interval_secs)?;
    require_positive("probes.network_interval_secs", probes.network_interval_secs)?;
    require_positive("probes.file_interval_secs", probes.file_interval_secs)?;
    if probes.enable_file && probes.watch_paths.is_empty() {
        return Err(invalid(
            "probes.watch_paths",
            "At least one root is required when the file probe is enabled",
        ));
    }

    require_positive("sender.drain_interval_secs", config.sender.drain_interval_secs)?;

    if let Some(dir) = &config.spool.dir {
        if dir.as_os_str().is_empty() {
            return Err(invalid("spool.dir", "Must not be empty when set"));
        }
    }

    Ok(())
}

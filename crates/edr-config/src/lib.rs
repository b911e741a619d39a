//! EDR agent configuration loading and validation.
//!
//! This crate provides:
//! - The typed `AgentConfig` settings structure (every field defaulted)
//! - Config resolution (CLI → env → XDG → /etc → defaults)
//! - Semantic validation

pub mod resolve;
pub mod settings;
pub mod validate;

pub use resolve::{resolve_config, ConfigPath, ConfigSource};
pub use settings::{
    AckMode, AgentConfig, CollectorSettings, ProbeSettings, SenderSettings, SpoolSettings,
};
pub use validate::{validate_config, ValidationError, ValidationResult};

use std::path::Path;

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";

/// Loaded configuration together with where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: AgentConfig,
    pub origin: ConfigPath,
}

/// Resolve, load and validate the agent configuration.
///
/// When no file is found the built-in defaults are returned (and validated).
pub fn load_config(cli_path: Option<&Path>) -> ValidationResult<LoadedConfig> {
    let origin = resolve_config(cli_path);
    let config = match origin.path.as_deref() {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };
    validate_config(&config)?;
    Ok(LoadedConfig { config, origin })
}

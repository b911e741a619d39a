//! Agent settings structure.
//!
//! Mirrors `agent.json`. Missing keys fall back to the defaults below, so a
//! partial file (or none at all) always yields a complete configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::validate::ValidationError;

/// Top-level agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub schema_version: String,
    pub collector: CollectorSettings,
    pub probes: ProbeSettings,
    pub sender: SenderSettings,
    pub spool: SpoolSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            schema_version: crate::CONFIG_SCHEMA_VERSION.to_string(),
            collector: CollectorSettings::default(),
            probes: ProbeSettings::default(),
            sender: SenderSettings::default(),
            spool: SpoolSettings::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ValidationError::IoError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(json)
            .map_err(|e| ValidationError::ParseError(format!("Invalid JSON: {}", e)))
    }
}

/// How the transport confirms delivery of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Wait for one acknowledgement line per frame.
    #[default]
    Confirmed,
    /// A successful write counts as delivery.
    FireAndForget,
}

/// Remote collector endpoint and reconnection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Bound on any single read or write on an established connection.
    pub io_timeout_ms: u64,
    pub ack_mode: AckMode,
    pub reconnect_interval_secs: u64,
    /// Attempts per reconnect burst before cooling down.
    pub max_retries: u32,
    /// Pause between bursts once retries are exhausted.
    pub retry_cooldown_secs: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            connect_timeout_ms: 5_000,
            io_timeout_ms: 10_000,
            ack_mode: AckMode::Confirmed,
            reconnect_interval_secs: 5,
            max_retries: 3,
            retry_cooldown_secs: 60,
        }
    }
}

impl CollectorSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown_secs)
    }
}

/// Per-probe cadence and scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub enable_process: bool,
    pub enable_network: bool,
    pub enable_file: bool,
    pub process_interval_secs: u64,
    pub network_interval_secs: u64,
    pub file_interval_secs: u64,
    /// Roots watched recursively by the file probe.
    pub watch_paths: Vec<PathBuf>,
    pub hash_executables: bool,
    /// Files larger than this are reported without a content hash.
    pub max_hash_bytes: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            enable_process: true,
            enable_network: true,
            enable_file: true,
            process_interval_secs: 5,
            network_interval_secs: 5,
            file_interval_secs: 5,
            watch_paths: vec![PathBuf::from(".")],
            hash_executables: true,
            max_hash_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ProbeSettings {
    pub fn process_interval(&self) -> Duration {
        Duration::from_secs(self.process_interval_secs)
    }

    pub fn network_interval(&self) -> Duration {
        Duration::from_secs(self.network_interval_secs)
    }

    pub fn file_interval(&self) -> Duration {
        Duration::from_secs(self.file_interval_secs)
    }
}

/// Spool drain cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderSettings {
    pub drain_interval_secs: u64,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            drain_interval_secs: 5,
        }
    }
}

impl SenderSettings {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

/// Location of the durable spool.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolSettings {
    /// Spool root; `None` selects the platform data directory.
    pub dir: Option<PathBuf>,
}

impl SpoolSettings {
    /// Effective spool root.
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(default_spool_dir)
    }
}

/// Get the spool base directory from the XDG data dir.
pub fn default_spool_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("edr-agent")
        .join("spool")
}

//! Error types for the EDR agent.
//!
//! This module provides structured error handling with:
//! - Stable error codes for machine parsing
//! - Category classification for error grouping
//! - Recoverability hints for supervision logic
//! - Remediation suggestions for operators
//!
//! # Propagation
//!
//! Per-entity failures (`TransientIo`) are absorbed inside probes. Only
//! `Transport`/`NotConnected` reach the connection state machine, and only
//! `Corrupt` surfaces to operators (as a quarantined spool record). None of
//! these is fatal to the agent.
//!
//! ```json
//! {
//!   "code": 40,
//!   "category": "spool",
//!   "message": "corrupt spool entry 1760866222123456-0000000042-file: EOF while parsing",
//!   "recoverable": false,
//!   "context": { "entry_id": "1760866222123456-0000000042-file" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration loading and validation.
    Config,
    /// Probe sampling.
    Collection,
    /// Collector connection and transmission.
    Transport,
    /// Durable spool storage.
    Spool,
    /// Generic file I/O and serialization.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Collection => write!(f, "collection"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Spool => write!(f, "spool"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for the agent.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    // Collection errors (20-29)
    #[error("transient failure inspecting {entity}: {reason}")]
    TransientIo { entity: String, reason: String },

    #[error("probe {probe} unavailable: {reason}")]
    ProbeUnavailable { probe: String, reason: String },

    // Transport errors (30-39)
    #[error("not connected to collector")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    // Spool errors (40-49)
    #[error("corrupt spool entry {entry_id}: {reason}")]
    Corrupt { entry_id: String, reason: String },

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Collection errors
    /// - 30-39: Transport errors
    /// - 40-49: Spool errors
    /// - 60-69: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::TransientIo { .. } => 20,
            Error::ProbeUnavailable { .. } => 21,
            Error::NotConnected => 30,
            Error::Transport(_) => 31,
            Error::Corrupt { .. } => 40,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) => ErrorCategory::Config,
            Error::TransientIo { .. } | Error::ProbeUnavailable { .. } => {
                ErrorCategory::Collection
            }
            Error::NotConnected | Error::Transport(_) => ErrorCategory::Transport,
            Error::Corrupt { .. } => ErrorCategory::Spool,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether retrying the same operation later can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::TransientIo { .. } => true,
            Error::ProbeUnavailable { .. } => true, // root may appear later
            Error::NotConnected => true,
            Error::Transport(_) => true,
            Error::Corrupt { .. } => false, // never retried, quarantined
            Error::Io(_) => true,
            Error::Json(_) => false,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) => {
                "Run 'edr-agent config validate' and fix the reported field, or remove the file to use defaults."
            }
            Error::TransientIo { .. } => {
                "No action needed. The entity is skipped for this pass and retried on the next one."
            }
            Error::ProbeUnavailable { .. } => {
                "Check that the watch roots exist and that the agent can read /proc. The probe keeps running degraded."
            }
            Error::NotConnected => {
                "Events stay in the spool. Check collector reachability; the agent reconnects automatically."
            }
            Error::Transport(_) => {
                "Events stay in the spool. Check network path and collector health."
            }
            Error::Corrupt { .. } => {
                "Inspect the record under the spool quarantine directory ('edr-agent spool quarantine'), then delete it."
            }
            Error::Io(_) => {
                "Check disk space and permissions on the spool directory."
            }
            Error::Json(_) => {
                "Invalid JSON. Check syntax with 'jq .' or restore the file from backup."
            }
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::TransientIo { .. } => "Transient Collection Failure",
            Error::ProbeUnavailable { .. } => "Probe Unavailable",
            Error::NotConnected => "Not Connected",
            Error::Transport(_) => "Transport Error",
            Error::Corrupt { .. } => "Corrupt Spool Entry",
            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Parse Error",
        }
    }
}

/// Structured error response for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error is potentially recoverable.
    pub recoverable: bool,

    /// Additional structured context (e.g., entry id, probe name).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::Corrupt { entry_id, .. } => {
                context.insert("entry_id".to_string(), serde_json::json!(entry_id));
            }
            Error::ProbeUnavailable { probe, .. } => {
                context.insert("probe".to_string(), serde_json::json!(probe));
            }
            Error::TransientIo { entity, .. } => {
                context.insert("entity".to_string(), serde_json::json!(entity));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            context,
        }
    }
}

impl StructuredError {
    /// Add additional context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}

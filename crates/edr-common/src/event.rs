//! Canonical event schema.
//!
//! Every probe output is normalized into a [`CanonicalEvent`]: a fixed set of
//! kind-specific fields plus an optional map of OS-specific extensions. All
//! fields carry defaults so a partially observed entity still produces a
//! structurally complete event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Event kind, one per probe family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Process,
    Network,
    File,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Process, EventKind::Network, EventKind::File];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Process => "process",
            EventKind::Network => "network",
            EventKind::File => "file",
        }
    }

    /// Transport channel carrying events of this kind.
    pub fn channel(&self) -> &'static str {
        match self {
            EventKind::Process => "process_logs",
            EventKind::Network => "network_logs",
            EventKind::File => "file_logs",
        }
    }

    /// Parse the short name used in spool entry ids.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "process" => Some(EventKind::Process),
            "network" => Some(EventKind::Network),
            "file" => Some(EventKind::File),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating system family used to select extension fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlatformTag {
    Linux,
    Windows,
    MacOs,
    Other,
}

impl PlatformTag {
    /// Platform the agent was compiled for.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => PlatformTag::Linux,
            "windows" => PlatformTag::Windows,
            "macos" => PlatformTag::MacOs,
            _ => PlatformTag::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformTag::Linux => "Linux",
            PlatformTag::Windows => "Windows",
            PlatformTag::MacOs => "macOS",
            PlatformTag::Other => "Other",
        }
    }
}

impl fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection direction relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
    #[default]
    Unknown,
}

/// Kind of filesystem observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventType {
    Created,
    Modified,
    Deleted,
    /// File seen open by a process during a periodic scan.
    Open,
    #[default]
    Unknown,
}

/// Process observation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessFields {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub command_line: String,
    pub executable_path: String,
    pub user: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    /// SHA-256 of the executable, hex encoded; empty when unavailable.
    pub hash: String,
}

/// Network connection observation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkFields {
    pub pid: u32,
    pub process_name: String,
    pub protocol: String,
    pub local_address: String,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    pub direction: Direction,
}

/// Filesystem observation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileFields {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub hash: String,
    pub event_type: FileEventType,
    pub pid: u32,
    pub process_name: String,
    pub user: String,
}

/// Kind-specific attribute set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventFields {
    Process(ProcessFields),
    Network(NetworkFields),
    File(FileFields),
}

impl EventFields {
    pub fn kind(&self) -> EventKind {
        match self {
            EventFields::Process(_) => EventKind::Process,
            EventFields::Network(_) => EventKind::Network,
            EventFields::File(_) => EventKind::File,
        }
    }
}

/// Normalized, schema-fixed representation of one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Identifier assigned once at normalization; redeliveries carry the same
    /// value so consumers can drop duplicates.
    pub event_id: uuid::Uuid,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub os_type: PlatformTag,
    pub fields: EventFields,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub os_variant_fields: BTreeMap<String, Value>,
}

impl CanonicalEvent {
    pub fn kind(&self) -> EventKind {
        self.fields.kind()
    }

    /// Short human label used in log lines.
    pub fn summary(&self) -> String {
        match &self.fields {
            EventFields::Process(p) => format!("process {} ({})", p.name, p.pid),
            EventFields::Network(n) => format!(
                "{} {}:{} -> {}:{}",
                n.protocol, n.local_address, n.local_port, n.remote_address, n.remote_port
            ),
            EventFields::File(f) => format!("file {:?} {}", f.event_type, f.path),
        }
    }
}

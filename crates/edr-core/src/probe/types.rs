//! Raw samples as probes observe them.
//!
//! Every field is optional and numeric fields use wide signed types: a probe
//! reports what it saw, and the normalizer decides what a missing or
//! out-of-range value becomes.

use chrono::{DateTime, Utc};
use edr_common::{Direction, EventKind, FileEventType};
use serde_json::Value;
use std::collections::BTreeMap;

/// Platform-specific attributes keyed by their canonical extension name
/// (`State`, `Threads`, `Owner`, ...).
pub type Extras = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawProcess {
    pub timestamp: Option<DateTime<Utc>>,
    pub pid: Option<i64>,
    pub ppid: Option<i64>,
    pub name: Option<String>,
    pub command_line: Option<String>,
    pub executable_path: Option<String>,
    pub user: Option<String>,
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<i64>,
    pub hash: Option<String>,
    pub extras: Extras,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawConnection {
    pub timestamp: Option<DateTime<Utc>>,
    pub pid: Option<i64>,
    pub process_name: Option<String>,
    pub protocol: Option<String>,
    pub local_address: Option<String>,
    pub local_port: Option<i64>,
    pub remote_address: Option<String>,
    pub remote_port: Option<i64>,
    pub direction: Option<Direction>,
    pub extras: Extras,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFile {
    pub timestamp: Option<DateTime<Utc>>,
    pub name: Option<String>,
    pub path: Option<String>,
    pub size: Option<i64>,
    pub hash: Option<String>,
    pub event_type: Option<FileEventType>,
    pub pid: Option<i64>,
    pub process_name: Option<String>,
    pub user: Option<String>,
    pub extras: Extras,
}

/// One observation from a probe.
#[derive(Debug, Clone, PartialEq)]
pub enum RawSample {
    Process(RawProcess),
    Network(RawConnection),
    File(RawFile),
}

impl RawSample {
    pub fn kind(&self) -> EventKind {
        match self {
            RawSample::Process(_) => EventKind::Process,
            RawSample::Network(_) => EventKind::Network,
            RawSample::File(_) => EventKind::File,
        }
    }
}

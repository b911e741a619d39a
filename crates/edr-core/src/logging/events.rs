//! Stable event names and pipeline stages used as structured log fields.

use serde::{Deserialize, Serialize};

/// Pipeline stage a log line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup and configuration.
    Init,
    /// Probe sampling and normalization.
    Collect,
    /// Spool writes and quarantine.
    Spool,
    /// Connection state changes.
    Connect,
    /// Spool drain and transmission.
    Send,
    /// Orderly stop.
    Shutdown,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Collect => "collect",
            Stage::Spool => "spool",
            Stage::Connect => "connect",
            Stage::Send => "send",
            Stage::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Agent lifecycle
    pub const AGENT_STARTED: &str = "agent.started";
    pub const AGENT_STOPPED: &str = "agent.stopped";

    // Config
    pub const CONFIG_LOADED: &str = "config.loaded";
    pub const CONFIG_DEFAULT_USED: &str = "config.default_used";

    // Probes
    pub const PROBE_STARTED: &str = "probe.started";
    pub const PROBE_UNAVAILABLE: &str = "probe.unavailable";
    pub const PROBE_PASS: &str = "probe.pass";
    pub const PROBE_STOPPED: &str = "probe.stopped";
    pub const PROBE_LATE: &str = "probe.late";

    // Spool
    pub const SPOOL_WRITE_FAILED: &str = "spool.write_failed";

    // Connection
    pub const CONN_TRANSITION: &str = "conn.transition";
    pub const CONN_ATTEMPT_FAILED: &str = "conn.attempt_failed";
    pub const CONN_COOLDOWN: &str = "conn.cooldown";

    // Sender
    pub const DRAIN_PASS: &str = "drain.pass";
    pub const DRAIN_REMOVE_FAILED: &str = "drain.remove_failed";
}

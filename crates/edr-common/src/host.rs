//! Host identity announced to the collector on every new connection.

use serde::{Deserialize, Serialize};

/// Registration payload.
///
/// Every field has a default so a partially discoverable host still
/// registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostIdentity {
    pub hostname: String,
    pub os_type: String,
    pub os_version: String,
    pub kernel: String,
    pub architecture: String,
    pub ip: String,
    pub mac: String,
    pub version: String,
    pub uptime_secs: u64,
    pub user: String,
    pub platform: String,
}

impl Default for HostIdentity {
    fn default() -> Self {
        Self {
            hostname: crate::UNKNOWN.to_string(),
            os_type: crate::PlatformTag::current().to_string(),
            os_version: crate::UNKNOWN.to_string(),
            kernel: crate::UNKNOWN.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            ip: String::new(),
            mac: String::new(),
            version: crate::AGENT_VERSION.to_string(),
            uptime_secs: 0,
            user: String::new(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

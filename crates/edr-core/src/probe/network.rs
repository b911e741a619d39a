//! Network probe: one sample per socket in the kernel socket tables.
//!
//! # Data Sources
//! - `/proc/net/tcp`, `tcp6`, `udp`, `udp6` for socket tables
//! - `/proc/<pid>/fd/` links (`socket:[inode]`) to attribute sockets to
//!   processes
//!
//! Each pass records the set of `local:port-remote:port` keys so that new
//! and closed connections can be counted against the previous pass.

use super::procfs::{self, PROC_ROOT};
use super::{OnceFlag, Probe, RawConnection, RawSample};
use crate::logging::{event_names, Stage};
use chrono::Utc;
use edr_common::{Direction, EventKind};
use edr_config::ProbeSettings;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// TCP connection state from the `st` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    Unknown,
}

impl TcpState {
    /// Parse TCP state from its /proc/net/tcp hex value.
    pub fn from_hex(hex: u8) -> Self {
        match hex {
            0x01 => TcpState::Established,
            0x02 => TcpState::SynSent,
            0x03 => TcpState::SynRecv,
            0x04 => TcpState::FinWait1,
            0x05 => TcpState::FinWait2,
            0x06 => TcpState::TimeWait,
            0x07 => TcpState::Close,
            0x08 => TcpState::CloseWait,
            0x09 => TcpState::LastAck,
            0x0A => TcpState::Listen,
            0x0B => TcpState::Closing,
            _ => TcpState::Unknown,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::SynSent | TcpState::SynRecv
        )
    }

    pub fn is_listen(&self) -> bool {
        matches!(self, TcpState::Listen)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TcpState::Established => "ESTABLISHED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::FinWait2 => "FIN_WAIT2",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Listen => "LISTEN",
            TcpState::Closing => "CLOSING",
            TcpState::Unknown => "UNKNOWN",
        }
    }
}

/// Socket table a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketTable {
    Tcp,
    Tcp6,
    Udp,
    Udp6,
}

impl SocketTable {
    pub const ALL: [SocketTable; 4] = [
        SocketTable::Tcp,
        SocketTable::Tcp6,
        SocketTable::Udp,
        SocketTable::Udp6,
    ];

    /// File name under `<proc>/net/`, also used as the protocol label.
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketTable::Tcp => "tcp",
            SocketTable::Tcp6 => "tcp6",
            SocketTable::Udp => "udp",
            SocketTable::Udp6 => "udp6",
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, SocketTable::Tcp6 | SocketTable::Udp6)
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, SocketTable::Tcp | SocketTable::Tcp6)
    }
}

/// One row of a socket table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub table: SocketTable,
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    pub state: TcpState,
    pub inode: u64,
}

impl SocketEntry {
    /// `local:port-remote:port`
    pub fn connection_key(&self) -> String {
        format!(
            "{}:{}-{}:{}",
            self.local_addr, self.local_port, self.remote_addr, self.remote_port
        )
    }

    /// Bound and waiting for peers: TCP LISTEN, or UDP with no peer.
    pub fn is_listening(&self) -> bool {
        if self.table.is_tcp() {
            self.state.is_listen()
        } else {
            self.local_port != 0 && self.remote_port == 0
        }
    }

    fn status(&self) -> &'static str {
        if self.table.is_tcp() {
            self.state.as_str()
        } else if self.remote_port == 0 {
            "NONE"
        } else {
            "CONNECTED"
        }
    }
}

/// Parse a socket table.
///
/// Format: sl local_address rem_address st tx_queue:rx_queue tr:tm->when retrnsmt uid timeout inode
pub fn parse_socket_table(content: &str, table: SocketTable) -> Vec<SocketEntry> {
    let is_ipv6 = table.is_ipv6();
    let mut entries = Vec::new();

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }

        let (local_addr, local_port) = parse_addr_port(parts[1], is_ipv6);
        let (remote_addr, remote_port) = parse_addr_port(parts[2], is_ipv6);
        let state = u8::from_str_radix(parts[3], 16)
            .map(TcpState::from_hex)
            .unwrap_or(TcpState::Unknown);
        let inode = parts[9].parse().unwrap_or(0);

        entries.push(SocketEntry {
            table,
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            state,
            inode,
        });
    }

    entries
}

/// Parse address:port from /proc/net format (hex encoded).
fn parse_addr_port(addr_port: &str, is_ipv6: bool) -> (String, u16) {
    let Some((addr_hex, port_hex)) = addr_port.split_once(':') else {
        return (String::new(), 0);
    };
    let port = u16::from_str_radix(port_hex, 16).unwrap_or(0);
    let addr = if is_ipv6 {
        parse_ipv6_addr(addr_hex)
    } else {
        parse_ipv4_addr(addr_hex)
    };
    (addr, port)
}

/// Parse IPv4 address from little-endian hex.
fn parse_ipv4_addr(hex: &str) -> String {
    match u32::from_str_radix(hex, 16) {
        Ok(word) if hex.len() == 8 => Ipv4Addr::from(word.swap_bytes()).to_string(),
        _ => "0.0.0.0".to_string(),
    }
}

/// Parse IPv6 address stored as four little-endian 32-bit words.
fn parse_ipv6_addr(hex: &str) -> String {
    if hex.len() != 32 {
        return "::".to_string();
    }

    let mut segments = [0u16; 8];
    for i in 0..4 {
        if let Some(Ok(word)) = hex.get(i * 8..(i + 1) * 8).map(|w| u32::from_str_radix(w, 16)) {
            let word = word.swap_bytes();
            segments[i * 2] = (word >> 16) as u16;
            segments[i * 2 + 1] = (word & 0xFFFF) as u16;
        }
    }
    Ipv6Addr::from(segments).to_string()
}

/// Classify a connection relative to this host.
///
/// Listening sockets and connections on a locally listened port are
/// inbound; other active connections are outbound.
pub fn classify_direction(entry: &SocketEntry, listening_ports: &HashSet<u16>) -> Direction {
    let accepted = entry.remote_port != 0 && listening_ports.contains(&entry.local_port);
    if entry.is_listening() || accepted {
        return Direction::Inbound;
    }
    let active = if entry.table.is_tcp() {
        entry.state.is_active()
    } else {
        entry.remote_port != 0
    };
    if active {
        Direction::Outbound
    } else {
        Direction::Unknown
    }
}

pub struct NetworkProbe {
    proc_root: PathBuf,
    interval: Duration,
    previous_keys: HashSet<String>,
    unavailable: OnceFlag,
}

impl NetworkProbe {
    pub fn new(settings: &ProbeSettings) -> Self {
        Self::with_proc_root(settings, PROC_ROOT)
    }

    pub fn with_proc_root(settings: &ProbeSettings, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            interval: settings.network_interval(),
            previous_keys: HashSet::new(),
            unavailable: OnceFlag::default(),
        }
    }

    /// Rows of every readable socket table, or `None` if none was readable.
    fn read_tables(&self) -> Option<Vec<SocketEntry>> {
        let net = self.proc_root.join("net");
        let mut any = false;
        let mut entries = Vec::new();
        for table in SocketTable::ALL {
            if let Ok(content) = fs::read_to_string(net.join(table.as_str())) {
                any = true;
                entries.extend(parse_socket_table(&content, table));
            }
        }
        any.then_some(entries)
    }
}

/// Map socket inodes to the owning process.
fn socket_owners(proc_root: &Path) -> HashMap<u64, (u32, String)> {
    let mut owners = HashMap::new();
    let Ok(pids) = procfs::list_pids(proc_root) else {
        return owners;
    };
    for pid in pids {
        let inodes: Vec<u64> = procfs::fd_targets(proc_root, pid)
            .iter()
            .filter_map(|target| procfs::socket_inode(target))
            .collect();
        if inodes.is_empty() {
            continue;
        }
        let name = procfs::read_comm(proc_root, pid).unwrap_or_default();
        for inode in inodes {
            owners.entry(inode).or_insert_with(|| (pid, name.clone()));
        }
    }
    owners
}

impl Probe for NetworkProbe {
    fn name(&self) -> &'static str {
        "network"
    }

    fn kind(&self) -> EventKind {
        EventKind::Network
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn sample(&mut self) -> Vec<RawSample> {
        let Some(entries) = self.read_tables() else {
            if self.unavailable.first() {
                warn!(
                    event = event_names::PROBE_UNAVAILABLE,
                    stage = %Stage::Collect,
                    probe = "network",
                    root = %self.proc_root.display(),
                    "no socket table readable"
                );
            }
            return Vec::new();
        };
        self.unavailable.clear();

        let owners = socket_owners(&self.proc_root);
        let listening_ports: HashSet<u16> = entries
            .iter()
            .filter(|e| e.is_listening())
            .map(|e| e.local_port)
            .collect();

        let now = Utc::now();
        let mut keys = HashSet::with_capacity(entries.len());
        let samples: Vec<RawSample> = entries
            .iter()
            .map(|entry| {
                keys.insert(entry.connection_key());
                let owner = owners.get(&entry.inode);

                let mut extras = super::Extras::new();
                extras.insert("Status".into(), json!(entry.status()));

                RawSample::Network(RawConnection {
                    timestamp: Some(now),
                    pid: owner.map(|(pid, _)| i64::from(*pid)),
                    process_name: owner.map(|(_, name)| name.clone()),
                    protocol: Some(entry.table.as_str().to_string()),
                    local_address: Some(entry.local_addr.clone()),
                    local_port: Some(i64::from(entry.local_port)),
                    remote_address: Some(entry.remote_addr.clone()),
                    remote_port: Some(i64::from(entry.remote_port)),
                    direction: Some(classify_direction(entry, &listening_ports)),
                    extras,
                })
            })
            .collect();

        let opened = keys.difference(&self.previous_keys).count();
        let closed = self.previous_keys.difference(&keys).count();
        debug!(connections = keys.len(), opened, closed, "network pass");
        self.previous_keys = keys;
        samples
    }
}

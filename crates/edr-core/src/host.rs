//! Host identity discovery for the registration frame.
//!
//! Each attribute comes from one source and falls back to the
//! [`HostIdentity`] default when that source is missing.

use crate::probe::procfs::AccountDb;
use edr_common::{HostIdentity, PlatformTag, AGENT_VERSION};
use std::fs;
use std::net::{ToSocketAddrs, UdpSocket};
use std::path::{Path, PathBuf};

/// Filesystem locations consulted, overridable for tests.
#[derive(Debug, Clone)]
pub struct HostSources {
    pub proc_root: PathBuf,
    pub etc_root: PathBuf,
    pub sys_class_net: PathBuf,
}

impl Default for HostSources {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            etc_root: PathBuf::from("/etc"),
            sys_class_net: PathBuf::from("/sys/class/net"),
        }
    }
}

/// Identity of this host. `collector_addr` selects the source address
/// reported as `ip`.
pub fn collect_host_identity(collector_addr: &str) -> HostIdentity {
    collect_from(&HostSources::default(), Some(collector_addr))
}

pub fn collect_from(sources: &HostSources, collector_addr: Option<&str>) -> HostIdentity {
    let defaults = HostIdentity::default();
    let read = |path: PathBuf| fs::read_to_string(path).ok();

    let hostname = read(sources.proc_root.join("sys/kernel/hostname"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(system_hostname)
        .unwrap_or(defaults.hostname);

    let os_version = read(sources.etc_root.join("os-release"))
        .and_then(|content| parse_os_release(&content))
        .unwrap_or(defaults.os_version);

    let kernel = read(sources.proc_root.join("sys/kernel/osrelease"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or(defaults.kernel);

    let uptime_secs = read(sources.proc_root.join("uptime"))
        .and_then(|content| parse_uptime(&content))
        .unwrap_or(0);

    let ip = collector_addr
        .and_then(local_ip_towards)
        .unwrap_or(defaults.ip);

    let mac = first_mac(&sources.sys_class_net).unwrap_or(defaults.mac);

    HostIdentity {
        hostname,
        os_type: PlatformTag::current().to_string(),
        os_version,
        kernel,
        architecture: std::env::consts::ARCH.to_string(),
        ip,
        mac,
        version: AGENT_VERSION.to_string(),
        uptime_secs,
        user: current_user(&sources.etc_root).unwrap_or(defaults.user),
        platform: std::env::consts::OS.to_string(),
    }
}

/// `PRETTY_NAME` from os-release content, falling back to `NAME VERSION`.
pub fn parse_os_release(content: &str) -> Option<String> {
    let mut name = None;
    let mut version = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "PRETTY_NAME" if !value.is_empty() => return Some(value),
            "NAME" => name = Some(value),
            "VERSION" => version = Some(value),
            _ => {}
        }
    }
    match (name, version) {
        (Some(n), Some(v)) => Some(format!("{n} {v}")),
        (Some(n), None) => Some(n),
        _ => None,
    }
}

/// Whole seconds from `/proc/uptime` content ("12345.67 54321.00").
pub fn parse_uptime(content: &str) -> Option<u64> {
    let secs: f64 = content.split_whitespace().next()?.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| secs as u64)
}

/// MAC of the first interface (by name) that is not loopback and has a
/// non-zero address.
pub fn first_mac(sys_class_net: &Path) -> Option<String> {
    let mut names: Vec<String> = fs::read_dir(sys_class_net)
        .ok()?
        .flatten()
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    names.into_iter().find_map(|name| {
        let mac = fs::read_to_string(sys_class_net.join(&name).join("address")).ok()?;
        let mac = mac.trim().to_lowercase();
        (!mac.is_empty() && mac != "00:00:00:00:00:00").then_some(mac)
    })
}

/// Local address the kernel would use to reach `addr`. No packet is sent.
pub fn local_ip_towards(addr: &str) -> Option<String> {
    let target = addr.to_socket_addrs().ok()?.next()?;
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    let local = socket.local_addr().ok()?.ip();
    (!local.is_unspecified()).then(|| local.to_string())
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    (!name.is_empty()).then_some(name)
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[cfg(unix)]
fn current_user(etc_root: &Path) -> Option<String> {
    let uid = unsafe { libc::geteuid() };
    Some(AccountDb::load(etc_root).user_name(uid))
}

#[cfg(not(unix))]
fn current_user(_etc_root: &Path) -> Option<String> {
    std::env::var("USERNAME").ok()
}

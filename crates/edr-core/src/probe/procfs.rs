//! `/proc` and account database readers shared by the probes.
//!
//! All readers take an explicit root so tests can point them at a fake
//! tree. Parsing functions operate on file content and never touch the
//! filesystem.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Default procfs mount point.
pub const PROC_ROOT: &str = "/proc";

/// Fields of `/proc/<pid>/stat` used by the probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFields {
    pub comm: String,
    pub state: char,
    pub ppid: u32,
    pub utime: u64,
    pub stime: u64,
    pub priority: i64,
    pub nice: i64,
    pub num_threads: u32,
}

impl StatFields {
    pub fn total_ticks(&self) -> u64 {
        self.utime + self.stime
    }
}

/// Parse `/proc/<pid>/stat` content.
///
/// Format: pid (comm) state ppid pgrp session tty_nr tpgid flags
///         minflt cminflt majflt cmajflt utime stime cutime cstime
///         priority nice num_threads ...
///
/// `comm` may contain spaces and parentheses, so it is delimited by the
/// first `(` and the last `)`.
pub fn parse_stat_content(content: &str) -> Option<StatFields> {
    let comm_start = content.find('(')?;
    let comm_end = content.rfind(')')?;
    if comm_end < comm_start {
        return None;
    }
    let comm = content[comm_start + 1..comm_end].to_string();
    let after_comm = content.get(comm_end + 2..)?;

    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    if fields.len() < 18 {
        return None;
    }

    Some(StatFields {
        comm,
        state: fields[0].chars().next().unwrap_or('?'),
        ppid: fields[1].parse().unwrap_or(0),
        utime: fields[11].parse().ok()?,
        stime: fields[12].parse().ok()?,
        priority: fields[15].parse().unwrap_or(0),
        nice: fields[16].parse().unwrap_or(0),
        num_threads: fields[17].parse().unwrap_or(0),
    })
}

/// Human label for a `/proc/<pid>/stat` state letter.
pub fn state_label(state: char) -> &'static str {
    match state {
        'R' => "running",
        'S' => "sleeping",
        'D' => "disk-sleep",
        'Z' => "zombie",
        'T' => "stopped",
        't' => "tracing-stop",
        'X' | 'x' => "dead",
        'I' => "idle",
        'P' => "parked",
        'W' => "waking",
        _ => "unknown",
    }
}

/// Real uid and gid from `/proc/<pid>/status` content.
pub fn parse_status_ids(content: &str) -> (Option<u32>, Option<u32>) {
    let mut uid = None;
    let mut gid = None;
    for line in content.lines() {
        // Format: "Uid:\t1000\t1000\t1000\t1000"; the first value is the real id.
        if let Some(rest) = line.strip_prefix("Uid:") {
            uid = rest.split_whitespace().next().and_then(|v| v.parse().ok());
        } else if let Some(rest) = line.strip_prefix("Gid:") {
            gid = rest.split_whitespace().next().and_then(|v| v.parse().ok());
        }
        if uid.is_some() && gid.is_some() {
            break;
        }
    }
    (uid, gid)
}

/// Join NUL-separated `/proc/<pid>/cmdline` arguments with spaces.
pub fn parse_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resident set size in pages from `/proc/<pid>/statm` content.
///
/// Format: "size resident shared text lib data dt"
pub fn parse_statm_resident(content: &str) -> Option<u64> {
    content.split_whitespace().nth(1)?.parse().ok()
}

/// Socket inode from an fd link target like `socket:[12345]`.
pub fn socket_inode(target: &Path) -> Option<u64> {
    target
        .to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Numeric entries under the proc root.
pub fn list_pids(proc_root: &Path) -> std::io::Result<Vec<u32>> {
    let mut pids: Vec<u32> = fs::read_dir(proc_root)?
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    pids.sort_unstable();
    Ok(pids)
}

/// Link targets of every readable fd of `pid`.
///
/// Permission denied and vanished processes yield an empty list.
pub fn fd_targets(proc_root: &Path, pid: u32) -> Vec<PathBuf> {
    let fd_dir = proc_root.join(pid.to_string()).join("fd");
    let Ok(entries) = fs::read_dir(&fd_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| fs::read_link(entry.path()).ok())
        .collect()
}

/// Short command name of `pid`, or `None` if the process is gone.
pub fn read_comm(proc_root: &Path, pid: u32) -> Option<String> {
    let dir = proc_root.join(pid.to_string());
    if let Ok(comm) = fs::read_to_string(dir.join("comm")) {
        return Some(comm.trim_end().to_string());
    }
    fs::read_to_string(dir.join("stat"))
        .ok()
        .and_then(|content| parse_stat_content(&content))
        .map(|stat| stat.comm)
}

/// System clock ticks per second (USER_HZ).
#[cfg(unix)]
pub fn clk_tck() -> u64 {
    static CLK_TCK: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *CLK_TCK.get_or_init(|| {
        let tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if tck > 0 {
            tck as u64
        } else {
            100
        }
    })
}

#[cfg(not(unix))]
pub fn clk_tck() -> u64 {
    100
}

/// Memory page size in bytes.
#[cfg(unix)]
pub fn page_size() -> u64 {
    static PAGE_SIZE: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as u64
        } else {
            4096
        }
    })
}

#[cfg(not(unix))]
pub fn page_size() -> u64 {
    4096
}

/// uid/gid to name maps loaded from `passwd` and `group` files.
///
/// Unknown ids resolve to their decimal form.
#[derive(Debug, Clone, Default)]
pub struct AccountDb {
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl AccountDb {
    /// Load `<etc_root>/passwd` and `<etc_root>/group`; missing files give
    /// empty maps.
    pub fn load(etc_root: &Path) -> Self {
        let read = |name: &str| fs::read_to_string(etc_root.join(name)).unwrap_or_default();
        Self {
            users: parse_id_file(&read("passwd")),
            groups: parse_id_file(&read("group")),
        }
    }

    /// Load from `/etc`.
    pub fn system() -> Self {
        Self::load(Path::new("/etc"))
    }

    pub fn user_name(&self, uid: u32) -> String {
        self.users
            .get(&uid)
            .cloned()
            .unwrap_or_else(|| uid.to_string())
    }

    pub fn group_name(&self, gid: u32) -> String {
        self.groups
            .get(&gid)
            .cloned()
            .unwrap_or_else(|| gid.to_string())
    }
}

/// Parse `name:x:id:...` lines (shared by passwd and group).
fn parse_id_file(content: &str) -> HashMap<u32, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        if line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 3 {
            if let Ok(id) = fields[2].parse::<u32>() {
                map.entry(id).or_insert_with(|| fields[0].to_string());
            }
        }
    }
    map
}

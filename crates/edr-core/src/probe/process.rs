//! Process probe: one sample per live process per pass.
//!
//! Data sources under the proc root:
//! - `<pid>/stat` for name, parent, state, priority, threads and CPU ticks
//! - `<pid>/status` for real uid/gid
//! - `<pid>/cmdline`, `<pid>/exe`, `<pid>/statm`
//!
//! CPU usage is the tick delta since the previous pass divided by wall time,
//! so the first pass after start reports none.

use super::procfs::{self, AccountDb, PROC_ROOT};
use super::{OnceFlag, Probe, RawProcess, RawSample};
use crate::hash::HashCache;
use crate::logging::{event_names, Stage};
use chrono::Utc;
use edr_common::EventKind;
use edr_config::ProbeSettings;
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

pub struct ProcessProbe {
    proc_root: PathBuf,
    accounts: AccountDb,
    interval: Duration,
    hash_executables: bool,
    max_hash_bytes: u64,
    hashes: HashCache,
    previous_ticks: HashMap<u32, u64>,
    last_pass: Option<Instant>,
    unavailable: OnceFlag,
}

impl ProcessProbe {
    pub fn new(settings: &ProbeSettings) -> Self {
        Self::with_roots(settings, PROC_ROOT, AccountDb::system())
    }

    /// Probe reading from an alternate proc tree and account database.
    pub fn with_roots(
        settings: &ProbeSettings,
        proc_root: impl Into<PathBuf>,
        accounts: AccountDb,
    ) -> Self {
        Self {
            proc_root: proc_root.into(),
            accounts,
            interval: settings.process_interval(),
            hash_executables: settings.hash_executables,
            max_hash_bytes: settings.max_hash_bytes,
            hashes: HashCache::new(),
            previous_ticks: HashMap::new(),
            last_pass: None,
            unavailable: OnceFlag::default(),
        }
    }

    fn read_process(
        &mut self,
        pid: u32,
        elapsed_secs: Option<f64>,
        ticks: &mut HashMap<u32, u64>,
    ) -> Option<RawProcess> {
        let dir = self.proc_root.join(pid.to_string());
        // The process may have exited since enumeration.
        let stat = procfs::parse_stat_content(&fs::read_to_string(dir.join("stat")).ok()?)?;
        ticks.insert(pid, stat.total_ticks());

        let cpu_percent = elapsed_secs.and_then(|secs| {
            let previous = *self.previous_ticks.get(&pid)?;
            let delta = stat.total_ticks().saturating_sub(previous);
            Some(delta as f64 / procfs::clk_tck() as f64 / secs * 100.0)
        });

        let (uid, gid) = fs::read_to_string(dir.join("status"))
            .map(|content| procfs::parse_status_ids(&content))
            .unwrap_or((None, None));
        let command_line = fs::read(dir.join("cmdline"))
            .ok()
            .map(|raw| procfs::parse_cmdline(&raw));
        let exe = fs::read_link(dir.join("exe")).ok();
        let memory_bytes = fs::read_to_string(dir.join("statm"))
            .ok()
            .and_then(|content| procfs::parse_statm_resident(&content))
            .and_then(|pages| i64::try_from(pages.saturating_mul(procfs::page_size())).ok());

        let hash = match (&exe, self.hash_executables) {
            (Some(path), true) => self.hashes.get_or_compute(path, self.max_hash_bytes),
            _ => None,
        };

        let mut extras = super::Extras::new();
        extras.insert("State".into(), json!(procfs::state_label(stat.state)));
        extras.insert("Threads".into(), json!(stat.num_threads));
        extras.insert("Priority".into(), json!(stat.priority));
        extras.insert("Nice".into(), json!(stat.nice));
        if let Some(gid) = gid {
            extras.insert("GroupName".into(), json!(self.accounts.group_name(gid)));
        }

        Some(RawProcess {
            timestamp: Some(Utc::now()),
            pid: Some(i64::from(pid)),
            ppid: Some(i64::from(stat.ppid)),
            name: Some(stat.comm),
            command_line,
            executable_path: exe.map(|p| p.to_string_lossy().into_owned()),
            user: uid.map(|uid| self.accounts.user_name(uid)),
            cpu_percent,
            memory_bytes,
            hash,
            extras,
        })
    }
}

impl Probe for ProcessProbe {
    fn name(&self) -> &'static str {
        "process"
    }

    fn kind(&self) -> EventKind {
        EventKind::Process
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn sample(&mut self) -> Vec<RawSample> {
        let pids = match procfs::list_pids(&self.proc_root) {
            Ok(pids) => {
                self.unavailable.clear();
                pids
            }
            Err(e) => {
                if self.unavailable.first() {
                    warn!(
                        event = event_names::PROBE_UNAVAILABLE,
                        stage = %Stage::Collect,
                        probe = "process",
                        root = %self.proc_root.display(),
                        error = %e,
                        "process enumeration unavailable"
                    );
                }
                return Vec::new();
            }
        };

        let now = Instant::now();
        let elapsed_secs = self
            .last_pass
            .map(|previous| now.duration_since(previous).as_secs_f64())
            .filter(|secs| *secs > 0.0);

        let mut ticks = HashMap::with_capacity(pids.len());
        let samples: Vec<RawSample> = pids
            .into_iter()
            .filter_map(|pid| self.read_process(pid, elapsed_secs, &mut ticks))
            .map(RawSample::Process)
            .collect();

        self.previous_ticks = ticks;
        self.last_pass = Some(now);
        trace!(
            processes = samples.len(),
            cached_hashes = self.hashes.len(),
            "process pass"
        );
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_process(root: &Path, pid: u32, comm: &str, utime: u64, exe: Option<&Path>) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("stat"),
            format!("{pid} ({comm}) S 1 {pid} {pid} 0 -1 0 0 0 0 0 {utime} 10 0 0 20 5 2 0 100 0 0"),
        )
        .unwrap();
        fs::write(dir.join("status"), "Name:\tx\nUid:\t1000\t1000\t1000\t1000\nGid:\t100\t100\t100\t100\n").unwrap();
        fs::write(dir.join("cmdline"), format!("/usr/bin/{comm}\0--flag\0")).unwrap();
        fs::write(dir.join("statm"), "100 25 10 1 0 20 0\n").unwrap();
        if let Some(exe) = exe {
            std::os::unix::fs::symlink(exe, dir.join("exe")).unwrap();
        }
    }

    fn accounts(dir: &Path) -> AccountDb {
        fs::write(dir.join("passwd"), "alice:x:1000:1000::/home/alice:/bin/sh\n").unwrap();
        fs::write(dir.join("group"), "users:x:100:\n").unwrap();
        AccountDb::load(dir)
    }

    #[test]
    fn test_sample_reads_fake_proc_tree() {
        let proc_dir = TempDir::new().unwrap();
        let etc_dir = TempDir::new().unwrap();
        let bin = etc_dir.path().join("daemon-bin");
        fs::write(&bin, b"abc").unwrap();
        write_process(proc_dir.path(), 100, "daemon", 100, Some(&bin));
        write_process(proc_dir.path(), 200, "worker", 50, None);
        // Unparseable entry is skipped.
        fs::create_dir(proc_dir.path().join("300")).unwrap();
        fs::write(proc_dir.path().join("300").join("stat"), "garbage").unwrap();

        let mut probe = ProcessProbe::with_roots(
            &ProbeSettings::default(),
            proc_dir.path(),
            accounts(etc_dir.path()),
        );
        let samples = probe.sample();
        assert_eq!(samples.len(), 2);

        let RawSample::Process(daemon) = &samples[0] else {
            panic!("expected process sample");
        };
        assert_eq!(daemon.pid, Some(100));
        assert_eq!(daemon.ppid, Some(1));
        assert_eq!(daemon.name.as_deref(), Some("daemon"));
        assert_eq!(daemon.command_line.as_deref(), Some("/usr/bin/daemon --flag"));
        assert_eq!(daemon.user.as_deref(), Some("alice"));
        assert_eq!(daemon.memory_bytes, Some(25 * procfs::page_size() as i64));
        assert_eq!(daemon.cpu_percent, None);
        assert_eq!(
            daemon.hash.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(daemon.extras["State"], "sleeping");
        assert_eq!(daemon.extras["Threads"], 2);
        assert_eq!(daemon.extras["Nice"], 5);
        assert_eq!(daemon.extras["GroupName"], "users");
    }

    #[test]
    fn test_cpu_percent_from_tick_delta() {
        let proc_dir = TempDir::new().unwrap();
        let etc_dir = TempDir::new().unwrap();
        write_process(proc_dir.path(), 100, "busy", 100, None);

        let mut probe = ProcessProbe::with_roots(
            &ProbeSettings::default(),
            proc_dir.path(),
            accounts(etc_dir.path()),
        );
        probe.sample();

        std::thread::sleep(Duration::from_millis(20));
        fs::remove_dir_all(proc_dir.path().join("100")).unwrap();
        write_process(proc_dir.path(), 100, "busy", 150, None);

        let samples = probe.sample();
        let RawSample::Process(busy) = &samples[0] else {
            panic!("expected process sample");
        };
        assert!(busy.cpu_percent.unwrap() > 0.0);
    }

    #[test]
    fn test_hashing_disabled() {
        let proc_dir = TempDir::new().unwrap();
        let etc_dir = TempDir::new().unwrap();
        let bin = etc_dir.path().join("bin");
        fs::write(&bin, b"abc").unwrap();
        write_process(proc_dir.path(), 1, "init", 1, Some(&bin));

        let settings = ProbeSettings {
            hash_executables: false,
            ..ProbeSettings::default()
        };
        let mut probe = ProcessProbe::with_roots(&settings, proc_dir.path(), AccountDb::default());
        let samples = probe.sample();
        let RawSample::Process(init) = &samples[0] else {
            panic!("expected process sample");
        };
        assert_eq!(init.hash, None);
        assert!(init.executable_path.as_deref().unwrap().ends_with("bin"));
        // No passwd entry: numeric fallback.
        assert_eq!(init.user.as_deref(), Some("1000"));
    }

    #[test]
    fn test_missing_proc_root_degrades() {
        let dir = TempDir::new().unwrap();
        let mut probe = ProcessProbe::with_roots(
            &ProbeSettings::default(),
            dir.path().join("absent"),
            AccountDb::default(),
        );
        assert!(probe.sample().is_empty());
        assert!(probe.sample().is_empty());
    }
}

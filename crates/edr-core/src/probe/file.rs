//! File probe: recursive change notifications plus a periodic open-file scan.
//!
//! Push: every configured root is watched recursively; create, modify,
//! delete and rename notifications become samples as they arrive.
//!
//! Pull: each pass walks `/proc/<pid>/fd` and reports regular files under a
//! watch root that some process holds open (`event_type = open`).
//!
//! Excluded directories (the agent's own spool) are never reported, even
//! when they sit inside a watch root.

use super::procfs::{self, AccountDb, PROC_ROOT};
use super::{OnceFlag, Probe, ProbeError, RawFile, RawSample};
use crate::hash::{self, HashCache};
use crate::logging::{event_names, Stage};
use crate::signal::Shutdown;
use chrono::{DateTime, Utc};
use edr_common::{EventKind, FileEventType};
use edr_config::ProbeSettings;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, warn};

type WatchEvents = Receiver<notify::Result<Event>>;

/// Process holding a file open.
struct Opener {
    pid: u32,
    name: String,
    user: Option<String>,
}

pub struct FileProbe {
    roots: Vec<PathBuf>,
    excluded: Vec<PathBuf>,
    proc_root: PathBuf,
    interval: Duration,
    max_hash_bytes: u64,
    accounts: AccountDb,
    hashes: HashCache,
    watcher: Option<RecommendedWatcher>,
    events: Option<WatchEvents>,
    pushed: Vec<RawSample>,
    scan_unavailable: OnceFlag,
}

impl FileProbe {
    pub fn new(settings: &ProbeSettings) -> Self {
        Self::with_roots(settings, PROC_ROOT, AccountDb::system())
    }

    pub fn with_roots(
        settings: &ProbeSettings,
        proc_root: impl Into<PathBuf>,
        accounts: AccountDb,
    ) -> Self {
        // fd link targets are canonical, so roots must be too.
        let roots = settings.watch_paths.iter().map(|root| canonical(root)).collect();
        Self {
            roots,
            excluded: Vec::new(),
            proc_root: proc_root.into(),
            interval: settings.file_interval(),
            max_hash_bytes: settings.max_hash_bytes,
            accounts,
            hashes: HashCache::new(),
            watcher: None,
            events: None,
            pushed: Vec::new(),
            scan_unavailable: OnceFlag::default(),
        }
    }

    /// Never report anything under `dir`.
    pub fn exclude(mut self, dir: impl AsRef<Path>) -> Self {
        self.excluded.push(canonical(dir.as_ref()));
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn under_roots(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.excluded.iter().any(|dir| path.starts_with(dir))
    }

    fn absorb(&mut self, result: notify::Result<Event>) {
        match result {
            Ok(event) => {
                for (path, event_type) in classify_event(&event) {
                    if let Some(raw) = self.describe(&path, event_type, None) {
                        self.pushed.push(RawSample::File(raw));
                    }
                }
            }
            Err(e) => debug!(error = %e, "file watch error"),
        }
    }

    /// Build a sample for `path`. Directories are not reported.
    fn describe(
        &mut self,
        path: &Path,
        event_type: FileEventType,
        opener: Option<Opener>,
    ) -> Option<RawFile> {
        if self.is_excluded(path) {
            return None;
        }
        let metadata = match event_type {
            FileEventType::Deleted => None,
            _ => fs::metadata(path).ok(),
        };
        if metadata.as_ref().is_some_and(|m| m.is_dir()) {
            return None;
        }

        let hash = match (&metadata, event_type) {
            (None, _) => None,
            // Open files are rescanned every pass; reuse earlier hashes.
            (Some(_), FileEventType::Open) => self.hashes.get_or_compute(path, self.max_hash_bytes),
            (Some(_), _) => hash::sha256_file(path, self.max_hash_bytes).ok().flatten(),
        };

        let extras = metadata
            .as_ref()
            .map(|m| self.metadata_extras(m))
            .unwrap_or_default();

        Some(RawFile {
            timestamp: Some(Utc::now()),
            name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            path: Some(path.to_string_lossy().into_owned()),
            size: metadata.as_ref().and_then(|m| i64::try_from(m.len()).ok()),
            hash,
            event_type: Some(event_type),
            pid: opener.as_ref().map(|o| i64::from(o.pid)),
            process_name: opener.as_ref().map(|o| o.name.clone()),
            user: opener.and_then(|o| o.user),
            extras,
        })
    }

    #[cfg(unix)]
    fn metadata_extras(&self, metadata: &fs::Metadata) -> super::Extras {
        use std::os::unix::fs::MetadataExt;

        let rfc3339 = |time: std::io::Result<std::time::SystemTime>| {
            time.map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                .unwrap_or_default()
        };

        let mut extras = super::Extras::new();
        extras.insert("Owner".into(), json!(self.accounts.user_name(metadata.uid())));
        extras.insert("Group".into(), json!(self.accounts.group_name(metadata.gid())));
        extras.insert(
            "Permissions".into(),
            json!(format!("{:04o}", metadata.mode() & 0o7777)),
        );
        extras.insert("Inode".into(), json!(metadata.ino()));
        extras.insert("Device".into(), json!(metadata.dev()));
        extras.insert("HardLinks".into(), json!(metadata.nlink()));
        extras.insert("LastModified".into(), json!(rfc3339(metadata.modified())));
        extras.insert("LastAccessed".into(), json!(rfc3339(metadata.accessed())));
        extras
    }

    #[cfg(not(unix))]
    fn metadata_extras(&self, metadata: &fs::Metadata) -> super::Extras {
        let mut extras = super::Extras::new();
        if let Ok(modified) = metadata.modified() {
            extras.insert(
                "LastModified".into(),
                json!(DateTime::<Utc>::from(modified).to_rfc3339()),
            );
        }
        extras
    }

    /// Open files under the watch roots, one sample per (pid, path).
    fn scan_open_files(&mut self) -> Vec<RawSample> {
        let pids = match procfs::list_pids(&self.proc_root) {
            Ok(pids) => {
                self.scan_unavailable.clear();
                pids
            }
            Err(e) => {
                if self.scan_unavailable.first() {
                    warn!(
                        event = event_names::PROBE_UNAVAILABLE,
                        stage = %Stage::Collect,
                        probe = "file",
                        root = %self.proc_root.display(),
                        error = %e,
                        "open-file scan unavailable"
                    );
                }
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        let mut samples = Vec::new();
        for pid in pids {
            let targets: Vec<PathBuf> = procfs::fd_targets(&self.proc_root, pid)
                .into_iter()
                .filter(|target| target.is_absolute() && self.under_roots(target))
                .collect();
            if targets.is_empty() {
                continue;
            }

            let name = procfs::read_comm(&self.proc_root, pid).unwrap_or_default();
            let uid = fs::read_to_string(self.proc_root.join(pid.to_string()).join("status"))
                .ok()
                .and_then(|content| procfs::parse_status_ids(&content).0);
            for target in targets {
                if !seen.insert((pid, target.clone())) {
                    continue;
                }
                let opener = Opener {
                    pid,
                    name: name.clone(),
                    user: uid.map(|uid| self.accounts.user_name(uid)),
                };
                if let Some(raw) = self.describe(&target, FileEventType::Open, Some(opener)) {
                    samples.push(RawSample::File(raw));
                }
            }
        }
        samples
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Map a notification to (path, event type) pairs.
///
/// Access and unclassified notifications are dropped. A rename carrying
/// both ends becomes a delete of the old path and a create of the new one.
pub fn classify_event(event: &Event) -> Vec<(PathBuf, FileEventType)> {
    use notify::EventKind as Kind;

    let all = |event_type: FileEventType| {
        event
            .paths
            .iter()
            .map(|p| (p.clone(), event_type))
            .collect::<Vec<_>>()
    };

    match &event.kind {
        Kind::Create(_) => all(FileEventType::Created),
        Kind::Remove(_) => all(FileEventType::Deleted),
        Kind::Modify(ModifyKind::Name(RenameMode::From)) => all(FileEventType::Deleted),
        Kind::Modify(ModifyKind::Name(RenameMode::To)) => all(FileEventType::Created),
        Kind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.push((from.clone(), FileEventType::Deleted));
            }
            if let Some(to) = event.paths.get(1) {
                out.push((to.clone(), FileEventType::Created));
            }
            out
        }
        Kind::Modify(_) => all(FileEventType::Modified),
        Kind::Access(_) | Kind::Any | Kind::Other => Vec::new(),
    }
}

impl Probe for FileProbe {
    fn name(&self) -> &'static str {
        "file"
    }

    fn kind(&self) -> EventKind {
        EventKind::File
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn start(&mut self) -> Result<(), ProbeError> {
        // An excluded directory may only have been created since construction.
        for dir in &mut self.excluded {
            *dir = canonical(dir);
        }

        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(tx)?;

        let mut watched = 0usize;
        for root in &self.roots {
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => watched += 1,
                Err(e) => warn!(
                    event = event_names::PROBE_UNAVAILABLE,
                    stage = %Stage::Collect,
                    probe = "file",
                    root = %root.display(),
                    error = %e,
                    "watch root unavailable"
                ),
            }
        }
        if watched == 0 {
            return Err(ProbeError::Unavailable {
                probe: "file",
                reason: "no watch root could be watched".to_string(),
            });
        }

        debug!(roots = watched, "file watch established");
        self.watcher = Some(watcher);
        self.events = Some(rx);
        Ok(())
    }

    fn sample(&mut self) -> Vec<RawSample> {
        self.scan_open_files()
    }

    fn wait_for_push(&mut self, timeout: Duration, shutdown: &Shutdown) -> bool {
        let mut batch = Vec::new();
        let disconnected = match self.events.as_ref() {
            None => {
                shutdown.wait_timeout(timeout);
                false
            }
            Some(rx) => match rx.recv_timeout(timeout) {
                Ok(first) => {
                    batch.push(first);
                    batch.extend(rx.try_iter());
                    false
                }
                Err(RecvTimeoutError::Timeout) => false,
                Err(RecvTimeoutError::Disconnected) => true,
            },
        };
        if disconnected {
            self.events = None;
        }
        for result in batch {
            self.absorb(result);
        }
        !self.pushed.is_empty()
    }

    fn drain_pushed(&mut self) -> Vec<RawSample> {
        std::mem::take(&mut self.pushed)
    }

    fn stop(&mut self) {
        // Dropping the watcher closes the channel after queued notifications.
        self.watcher = None;
        if let Some(rx) = self.events.take() {
            let queued: Vec<_> = rx.try_iter().collect();
            for result in queued {
                self.absorb(result);
            }
        }
    }
}

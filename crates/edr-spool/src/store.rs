//! Spool directory operations.

use crate::error::{SpoolError, SpoolResult};
use crate::record::{RecordRef, SpoolEntry};
use crate::{LOCK_FILE, PENDING_DIR, QUARANTINE_DIR, RECORD_EXT, TMP_DIR};
use chrono::Utc;
use edr_common::{CanonicalEvent, EntryId, EntryIdGenerator};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Fresh ids tried before enqueue gives up.
const MAX_ID_ATTEMPTS: u32 = 16;

/// Handle to an opened spool directory.
///
/// Safe to share between threads: writers only ever create new files, and
/// the single drainer is the only caller of [`Spool::remove`].
///
/// One process owns a spool at a time. [`Spool::open`] holds an exclusive
/// advisory lock on `<root>/.lock` for the life of the handle; other
/// processes look at the spool through [`Spool::inspect`].
#[derive(Debug)]
pub struct Spool {
    root: PathBuf,
    pending: PathBuf,
    tmp: PathBuf,
    quarantine: PathBuf,
    ids: EntryIdGenerator,
    lock: Option<File>,
}

/// Point-in-time summary for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpoolStats {
    pub root: PathBuf,
    pub pending: usize,
    pub pending_bytes: u64,
    pub quarantined: usize,
    pub oldest: Option<EntryId>,
    pub newest: Option<EntryId>,
}

impl Spool {
    /// Open (creating if needed) the spool at `root` as its owner.
    ///
    /// Fails with [`SpoolError::Locked`] while another handle owns it.
    /// Temporary files left by an interrupted write are deleted; they were
    /// never committed, so nothing is lost.
    pub fn open(root: impl Into<PathBuf>) -> SpoolResult<Self> {
        let mut spool = Self::layout(root.into())?;
        spool.lock = Some(acquire_lock(&spool.root)?);

        let removed = spool.clean_tmp()?;
        if removed > 0 {
            info!(
                removed,
                root = %spool.root.display(),
                "discarded incomplete spool writes"
            );
        }
        Ok(spool)
    }

    /// Open without taking ownership, for looking at a spool that a running
    /// agent may be writing. `tmp/` is left untouched.
    pub fn inspect(root: impl Into<PathBuf>) -> SpoolResult<Self> {
        Self::layout(root.into())
    }

    fn layout(root: PathBuf) -> SpoolResult<Self> {
        let pending = root.join(PENDING_DIR);
        let tmp = root.join(TMP_DIR);
        let quarantine = root.join(QUARANTINE_DIR);
        for dir in [&pending, &tmp, &quarantine] {
            fs::create_dir_all(dir).map_err(|e| SpoolError::io(dir, e))?;
        }
        Ok(Self {
            root,
            pending,
            tmp,
            quarantine,
            ids: EntryIdGenerator::new(),
            lock: None,
        })
    }

    /// True when this handle owns the spool.
    pub fn is_owner(&self) -> bool {
        self.lock.is_some()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the committed record for `id`.
    pub fn pending_path(&self, id: &EntryId) -> PathBuf {
        self.pending.join(record_file_name(id))
    }

    /// Path a corrupt record for `id` is moved to.
    pub fn quarantine_path(&self, id: &EntryId) -> PathBuf {
        self.quarantine.join(record_file_name(id))
    }

    /// Durably append `event`.
    ///
    /// Returns only after the record is fsynced and renamed into `pending/`.
    pub fn enqueue(&self, event: &CanonicalEvent) -> SpoolResult<EntryId> {
        let kind = event.kind();
        for _ in 0..MAX_ID_ATTEMPTS {
            let enqueued_at = Utc::now();
            let id = self.ids.next_at(enqueued_at, kind);
            let final_path = self.pending_path(&id);
            if final_path.exists() {
                debug!(entry_id = %id, "entry id already taken, regenerating");
                continue;
            }

            let bytes = serde_json::to_vec(&RecordRef::new(&id, enqueued_at, event))?;
            let tmp_path = self.tmp.join(format!("{}.{}.tmp", id, RECORD_EXT));
            match write_synced(&tmp_path, &bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    let _ = fs::remove_file(&tmp_path);
                    return Err(SpoolError::io(&tmp_path, e));
                }
            }

            // rename(2) replaces silently, so re-check right before committing.
            if final_path.exists() {
                let _ = fs::remove_file(&tmp_path);
                continue;
            }
            if let Err(e) = fs::rename(&tmp_path, &final_path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(SpoolError::io(&final_path, e));
            }
            sync_dir(&self.pending);

            debug!(entry_id = %id, kind = %kind, "event spooled");
            return Ok(id);
        }
        Err(SpoolError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    /// Committed entry ids, oldest first.
    pub fn list_pending(&self) -> SpoolResult<Vec<EntryId>> {
        list_records(&self.pending)
    }

    /// Ids of quarantined records, oldest first.
    pub fn list_quarantined(&self) -> SpoolResult<Vec<EntryId>> {
        list_records(&self.quarantine)
    }

    pub fn pending_count(&self) -> SpoolResult<usize> {
        Ok(self.list_pending()?.len())
    }

    pub fn quarantine_count(&self) -> SpoolResult<usize> {
        Ok(self.list_quarantined()?.len())
    }

    /// Read one committed record.
    ///
    /// A record that does not deserialize, or that carries a different id,
    /// is moved to `quarantine/` before `Corrupt` is returned, so it is
    /// never offered again.
    pub fn read(&self, id: &EntryId) -> SpoolResult<SpoolEntry> {
        let path = self.pending_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SpoolError::NotFound(id.clone()))
            }
            Err(e) => return Err(SpoolError::io(&path, e)),
        };

        let reason = match serde_json::from_slice::<SpoolEntry>(&bytes) {
            Ok(entry) if entry.id == *id => return Ok(entry),
            Ok(entry) => format!("record carries id {}", entry.id),
            Err(e) => e.to_string(),
        };

        self.move_to_quarantine(id)?;
        warn!(
            entry_id = %id,
            reason = %reason,
            quarantine = %self.quarantine_path(id).display(),
            "corrupt spool entry quarantined"
        );
        Err(SpoolError::Corrupt {
            id: id.clone(),
            reason,
        })
    }

    /// Delete a committed record. Removing an absent id succeeds.
    pub fn remove(&self, id: &EntryId) -> SpoolResult<()> {
        let path = self.pending_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(&self.pending);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpoolError::io(&path, e)),
        }
    }

    pub fn stats(&self) -> SpoolResult<SpoolStats> {
        let pending = self.list_pending()?;
        let pending_bytes = pending
            .iter()
            .filter_map(|id| fs::metadata(self.pending_path(id)).ok())
            .map(|m| m.len())
            .sum();
        Ok(SpoolStats {
            root: self.root.clone(),
            pending: pending.len(),
            pending_bytes,
            quarantined: self.quarantine_count()?,
            oldest: pending.first().cloned(),
            newest: pending.last().cloned(),
        })
    }

    fn move_to_quarantine(&self, id: &EntryId) -> SpoolResult<()> {
        let from = self.pending_path(id);
        let to = self.quarantine_path(id);
        fs::rename(&from, &to).map_err(|e| SpoolError::io(&from, e))?;
        sync_dir(&self.pending);
        sync_dir(&self.quarantine);
        Ok(())
    }

    fn clean_tmp(&self) -> SpoolResult<usize> {
        let mut removed = 0;
        let entries = fs::read_dir(&self.tmp).map_err(|e| SpoolError::io(&self.tmp, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| SpoolError::io(&self.tmp, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(SpoolError::io(&path, e)),
            }
        }
        Ok(removed)
    }
}

/// Take the exclusive owner lock; released when the returned file closes.
fn acquire_lock(root: &Path) -> SpoolResult<File> {
    let path = root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| SpoolError::io(&path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::WouldBlock {
                return Err(SpoolError::Locked(root.to_path_buf()));
            }
            return Err(SpoolError::io(&path, err));
        }
    }

    // Owner pid, for operators.
    let _ = file.set_len(0);
    let mut writer = &file;
    let _ = writer.write_all(std::process::id().to_string().as_bytes());
    Ok(file)
}

fn record_file_name(id: &EntryId) -> String {
    format!("{}.{}", id, RECORD_EXT)
}

fn list_records(dir: &Path) -> SpoolResult<Vec<EntryId>> {
    let mut ids = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| SpoolError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SpoolError::io(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(EntryId::parse)
        {
            ids.push(id);
        }
    }
    ids.sort();
    Ok(ids)
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Persist directory entries (renames, unlinks). Best effort: some
/// filesystems refuse fsync on directories.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edr_common::{EventFields, FileEventType, FileFields, PlatformTag, ProcessFields};
    use tempfile::TempDir;

    fn process_event(pid: u32) -> CanonicalEvent {
        CanonicalEvent {
            event_id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            hostname: "spool-test".to_string(),
            os_type: PlatformTag::Linux,
            fields: EventFields::Process(ProcessFields {
                pid,
                ppid: 1,
                name: "sshd".to_string(),
                cpu_percent: 12.5,
                memory_bytes: 4096,
                ..Default::default()
            }),
            os_variant_fields: Default::default(),
        }
    }

    fn file_event(path: &str) -> CanonicalEvent {
        CanonicalEvent {
            event_id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            hostname: "spool-test".to_string(),
            os_type: PlatformTag::Linux,
            fields: EventFields::File(FileFields {
                path: path.to_string(),
                event_type: FileEventType::Created,
                ..Default::default()
            }),
            os_variant_fields: Default::default(),
        }
    }

    #[test]
    fn test_open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path().join("spool")).unwrap();
        assert!(spool.root().join(PENDING_DIR).is_dir());
        assert!(spool.root().join(TMP_DIR).is_dir());
        assert!(spool.root().join(QUARANTINE_DIR).is_dir());
        assert_eq!(spool.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_enqueue_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        let event = process_event(4242);

        let id = spool.enqueue(&event).unwrap();
        assert_eq!(id.kind(), Some(edr_common::EventKind::Process));
        assert!(spool.pending_path(&id).is_file());

        let entry = spool.read(&id).unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.event, event);
        assert_eq!(entry.schema_version, crate::RECORD_SCHEMA_VERSION);
    }

    #[test]
    fn test_cpu_percent_reads_back_bit_exact() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        let mut event = process_event(11);
        if let EventFields::Process(fields) = &mut event.fields {
            fields.cpu_percent = 93.55968323342239;
        }
        event
            .os_variant_fields
            .insert("Load".into(), serde_json::json!(0.1 + 0.2));

        let id = spool.enqueue(&event).unwrap();
        assert_eq!(spool.read(&id).unwrap().event, event);
    }

    #[test]
    fn test_list_pending_in_enqueue_order() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        let a = spool.enqueue(&process_event(1)).unwrap();
        let b = spool.enqueue(&file_event("/etc/passwd")).unwrap();
        let c = spool.enqueue(&process_event(3)).unwrap();
        assert_eq!(spool.list_pending().unwrap(), vec![a, b, c]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        let id = spool.enqueue(&process_event(7)).unwrap();

        spool.remove(&id).unwrap();
        spool.remove(&id).unwrap();
        assert_eq!(spool.pending_count().unwrap(), 0);
        assert!(matches!(spool.read(&id), Err(SpoolError::NotFound(_))));
    }

    #[test]
    fn test_corrupt_record_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        let id = spool.enqueue(&process_event(9)).unwrap();
        fs::write(spool.pending_path(&id), b"{\"schema_version\": \"1.0.0\", \"id\"").unwrap();

        let err = spool.read(&id).unwrap_err();
        assert!(matches!(err, SpoolError::Corrupt { .. }));
        assert!(!spool.pending_path(&id).exists());
        assert!(spool.quarantine_path(&id).is_file());
        assert_eq!(spool.list_quarantined().unwrap(), vec![id]);
        assert_eq!(spool.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_mismatched_id_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        let a = spool.enqueue(&process_event(1)).unwrap();
        let b = spool.enqueue(&process_event(2)).unwrap();
        // Overwrite b's record with a's content.
        fs::copy(spool.pending_path(&a), spool.pending_path(&b)).unwrap();

        assert!(matches!(spool.read(&b), Err(SpoolError::Corrupt { .. })));
        assert_eq!(spool.list_pending().unwrap(), vec![a]);
    }

    #[test]
    fn test_open_discards_stale_tmp_files() {
        let dir = TempDir::new().unwrap();
        {
            let spool = Spool::open(dir.path()).unwrap();
            spool.enqueue(&process_event(1)).unwrap();
        }
        fs::write(
            dir.path().join(TMP_DIR).join("0000000000000001-0000000000-process.json.tmp"),
            b"{\"partial",
        )
        .unwrap();

        let spool = Spool::open(dir.path()).unwrap();
        assert_eq!(fs::read_dir(dir.path().join(TMP_DIR)).unwrap().count(), 0);
        assert_eq!(spool.pending_count().unwrap(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_second_owner_is_refused() {
        let dir = TempDir::new().unwrap();
        let owner = Spool::open(dir.path()).unwrap();
        assert!(owner.is_owner());
        assert!(matches!(Spool::open(dir.path()), Err(SpoolError::Locked(_))));

        drop(owner);
        assert!(Spool::open(dir.path()).unwrap().is_owner());
    }

    #[test]
    fn test_inspect_leaves_in_flight_writes_alone() {
        let dir = TempDir::new().unwrap();
        let owner = Spool::open(dir.path()).unwrap();
        owner.enqueue(&process_event(1)).unwrap();
        let in_flight = dir
            .path()
            .join(TMP_DIR)
            .join("0000000000000002-0000000001-process.json.tmp");
        fs::write(&in_flight, b"{\"partial").unwrap();

        let viewer = Spool::inspect(dir.path()).unwrap();
        assert!(!viewer.is_owner());
        assert_eq!(viewer.stats().unwrap().pending, 1);
        assert!(in_flight.is_file());
    }

    #[test]
    fn test_foreign_files_ignored() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        fs::write(dir.path().join(PENDING_DIR).join("README.txt"), b"hi").unwrap();
        fs::write(dir.path().join(PENDING_DIR).join("not-an-id.json"), b"{}").unwrap();
        let id = spool.enqueue(&file_event("/tmp/a")).unwrap();
        assert_eq!(spool.list_pending().unwrap(), vec![id]);
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        let first = spool.enqueue(&process_event(1)).unwrap();
        let last = spool.enqueue(&process_event(2)).unwrap();

        let stats = spool.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.quarantined, 0);
        assert!(stats.pending_bytes > 0);
        assert_eq!(stats.oldest, Some(first));
        assert_eq!(stats.newest, Some(last));
    }
}

//! SHA-256 content hashing with a per-run cache.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const READ_CHUNK: usize = 64 * 1024;

/// Hex-encoded SHA-256 of the file at `path`.
///
/// Returns `Ok(None)` when the file is larger than `max_bytes`.
pub fn sha256_file(path: &Path, max_bytes: u64) -> io::Result<Option<String>> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() > max_bytes {
        return Ok(None);
    }

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        // The file grew while being read.
        if total > max_bytes {
            return Ok(None);
        }
        hasher.update(&buf[..n]);
    }
    Ok(Some(hex::encode(hasher.finalize())))
}

/// Hashes keyed by (path, size).
///
/// Unbounded for the lifetime of the agent; a binary replaced in place with
/// a different size gets a fresh entry.
#[derive(Debug, Default)]
pub struct HashCache {
    entries: HashMap<(PathBuf, u64), String>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached hash for `path`, computing it on first sight.
    ///
    /// Unreadable or oversized files yield `None` and are not cached.
    pub fn get_or_compute(&mut self, path: &Path, max_bytes: u64) -> Option<String> {
        let size = std::fs::metadata(path).ok()?.len();
        let key = (path.to_path_buf(), size);
        if let Some(hash) = self.entries.get(&key) {
            return Some(hash.clone());
        }
        let hash = sha256_file(path, max_bytes).ok().flatten()?;
        self.entries.insert(key, hash.clone());
        Some(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

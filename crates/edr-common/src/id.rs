//! Spool entry identity.
//!
//! Format: `<unix_micros:016>-<sequence:010>-<kind>`
//! Example: `1760866222123456-0000000042-process`
//!
//! Fixed-width numeric fields make lexical order equal to enqueue order
//! within one agent run; across runs the timestamp dominates.

use crate::event::EventKind;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Identifier of one spool entry; also its on-disk file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Build an id from its components.
    pub fn from_parts(micros: i64, sequence: u64, kind: EventKind) -> Self {
        EntryId(format!(
            "{:016}-{:010}-{}",
            micros.max(0),
            sequence % 10_000_000_000,
            kind.as_str()
        ))
    }

    /// Parse and validate an id string.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '-');
        let micros = parts.next()?;
        let sequence = parts.next()?;
        let kind = parts.next()?;
        if micros.len() != 16 || !micros.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if sequence.len() != 10 || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        EventKind::parse(kind)?;
        Some(EntryId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Event kind encoded in the id.
    pub fn kind(&self) -> Option<EventKind> {
        self.0.rsplit('-').next().and_then(EventKind::parse)
    }

    /// Creation instant encoded in the id.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let micros: i64 = self.0.get(..16)?.parse().ok()?;
        Utc.timestamp_micros(micros).single()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collision-free id source shared by concurrent writers.
///
/// The sequence is process-wide and strictly increasing, so two writers that
/// read the same clock tick still receive distinct ids. The time component
/// never goes backwards within a process, even when the wall clock does.
#[derive(Debug, Default)]
pub struct EntryIdGenerator {
    sequence: AtomicU64,
    last_micros: AtomicI64,
}

impl EntryIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id for `kind`, stamped with the current time.
    pub fn next(&self, kind: EventKind) -> EntryId {
        self.next_at(Utc::now(), kind)
    }

    /// Next id for `kind`, stamped with `now`.
    pub fn next_at(&self, now: DateTime<Utc>, kind: EventKind) -> EntryId {
        let stamp = now.timestamp_micros();
        let micros = self.last_micros.fetch_max(stamp, Ordering::SeqCst).max(stamp);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        EntryId::from_parts(micros, sequence, kind)
    }
}

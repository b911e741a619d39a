use chrono::{DateTime, Utc};
use edr_common::{CanonicalEvent, EntryId};
use serde::{Deserialize, Serialize};

/// On-disk record format version.
pub const RECORD_SCHEMA_VERSION: &str = "1.0.0";

/// One committed spool record.
///
/// Created at enqueue and never rewritten; the sender removes it after a
/// confirmed send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub schema_version: String,
    pub id: EntryId,
    pub enqueued_at: DateTime<Utc>,
    pub event: CanonicalEvent,
}

/// Borrowed form of [`SpoolEntry`] used when writing, so enqueue does not
/// clone the event.
#[derive(Serialize)]
pub(crate) struct RecordRef<'a> {
    pub schema_version: &'static str,
    pub id: &'a EntryId,
    pub enqueued_at: DateTime<Utc>,
    pub event: &'a CanonicalEvent,
}

impl<'a> RecordRef<'a> {
    pub(crate) fn new(id: &'a EntryId, enqueued_at: DateTime<Utc>, event: &'a CanonicalEvent) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            id,
            enqueued_at,
            event,
        }
    }
}

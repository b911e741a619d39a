//! Durable spool for normalized events.
//!
//! Every event passes through the spool before it is transmitted. Writers
//! (one per probe thread) append records; a single reader (the sender)
//! drains them in id order and removes each one only after the collector
//! has accepted it.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── .lock         # advisory lock held by the owning agent
//! ├── pending/      # committed records, one `<entry_id>.json` each
//! ├── tmp/          # in-flight writes; anything here at open is a crash leftover
//! └── quarantine/   # records that failed to deserialize
//! ```
//!
//! A record becomes visible in `pending/` only through a rename of a fully
//! written and fsynced file, so a crash leaves it either absent or complete.
//! Only the owner clears `tmp/`, so inspecting a live spool never races
//! the agent's writes.

mod error;
mod record;
mod store;

pub use error::{SpoolError, SpoolResult};
pub use record::{SpoolEntry, RECORD_SCHEMA_VERSION};
pub use store::{Spool, SpoolStats};

/// Directory holding committed records.
pub const PENDING_DIR: &str = "pending";

/// Directory holding in-flight writes.
pub const TMP_DIR: &str = "tmp";

/// Directory holding records that could not be read back.
pub const QUARANTINE_DIR: &str = "quarantine";

/// Advisory lock file held by the spool owner.
pub const LOCK_FILE: &str = ".lock";

/// File extension of committed records.
pub const RECORD_EXT: &str = "json";

//! EDR agent common types, IDs, and errors.
//!
//! This crate provides foundational types shared across the agent crates:
//! - The canonical event schema every probe normalizes into
//! - Spool entry identifiers with collision-free generation
//! - Host identity sent on registration
//! - Common error taxonomy

pub mod error;
pub mod event;
pub mod host;
pub mod id;

pub use error::{Error, ErrorCategory, Result, StructuredError};
pub use event::{
    CanonicalEvent, Direction, EventFields, EventKind, FileEventType, FileFields, NetworkFields,
    PlatformTag, ProcessFields,
};
pub use host::HostIdentity;
pub use id::{EntryId, EntryIdGenerator};

/// Version string reported in registration frames.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version for serialized events and spool records.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Placeholder used for string fields whose value could not be determined.
pub const UNKNOWN: &str = "unknown";

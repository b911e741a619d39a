use edr_common::EntryId;
use std::path::PathBuf;
use thiserror::Error;

pub type SpoolResult<T> = Result<T, SpoolError>;

/// Errors from spool operations.
#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("spool I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize spool record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("spool entry not found: {0}")]
    NotFound(EntryId),

    #[error("corrupt spool entry {id}: {reason}")]
    Corrupt { id: EntryId, reason: String },

    #[error("no free entry id after {0} attempts")]
    IdExhausted(u32),

    #[error("spool {} is owned by another process", .0.display())]
    Locked(PathBuf),
}

impl SpoolError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SpoolError::Io {
            path: path.into(),
            source,
        }
    }

    /// True when retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SpoolError::Io { .. } | SpoolError::IdExhausted(_))
    }
}

impl From<SpoolError> for edr_common::Error {
    fn from(err: SpoolError) -> Self {
        match err {
            SpoolError::Io { path, source } => edr_common::Error::TransientIo {
                entity: path.display().to_string(),
                reason: source.to_string(),
            },
            SpoolError::Serialize(e) => edr_common::Error::Json(e),
            SpoolError::Corrupt { id, reason } => edr_common::Error::Corrupt {
                entry_id: id.to_string(),
                reason,
            },
            other @ (SpoolError::NotFound(_)
            | SpoolError::IdExhausted(_)
            | SpoolError::Locked(_)) => {
                edr_common::Error::TransientIo {
                    entity: "spool".to_string(),
                    reason: other.to_string(),
                }
            }
        }
    }
}

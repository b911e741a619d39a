//! Exit codes for the `edr-agent` binary.
//!
//! Exit code ranges:
//! - 0-1: Outcomes (clean stop, items needing attention)
//! - 10-19: User/environment errors (fixable by the operator)
//! - 20-29: Internal errors

/// Process exit status. Stable for scripts and service managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean run or orderly shutdown.
    Clean = 0,

    /// Command succeeded but found something needing attention
    /// (quarantined spool entries, pending backlog on status checks).
    Attention = 1,

    /// Invalid arguments.
    ArgsError = 10,

    /// Configuration missing, unreadable or invalid.
    ConfigError = 11,

    /// Permission denied on spool or probe sources.
    PermissionError = 12,

    /// Spool could not be opened.
    SpoolError = 13,

    /// Internal error (bug).
    InternalError = 20,

    /// I/O error.
    IoError = 21,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        (self as i32) < 10
    }

    /// Codes 10-19: resolvable by the operator.
    pub fn is_user_error(self) -> bool {
        (10..20).contains(&(self as i32))
    }

    pub fn is_internal_error(self) -> bool {
        (self as i32) >= 20
    }

    /// Name used in JSON output.
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::Attention => "OK_ATTENTION",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::PermissionError => "ERR_PERMISSION",
            ExitCode::SpoolError => "ERR_SPOOL",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }

    /// Exit code for an agent error.
    pub fn for_error(err: &edr_common::Error) -> Self {
        match err {
            edr_common::Error::Config(_) => ExitCode::ConfigError,
            edr_common::Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ExitCode::PermissionError
            }
            edr_common::Error::Io(_) | edr_common::Error::TransientIo { .. } => ExitCode::IoError,
            edr_common::Error::Corrupt { .. } => ExitCode::SpoolError,
            _ => ExitCode::InternalError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

//! Telemetry probes.
//!
//! A probe owns its sampling state and produces [`RawSample`]s when polled.
//! Probes that also receive pushed notifications (the file probe) buffer
//! them internally and hand them over through
//! [`Probe::wait_for_push`]/[`Probe::drain_pushed`].
//!
//! Per-entity failures (a process exiting mid-read, a permission error on
//! one file) are skipped silently. A probe-level failure such as a missing
//! `/proc` or an unwatchable root is reported once and the probe keeps
//! running degraded.

pub mod file;
pub mod network;
pub mod process;
pub mod procfs;
pub mod types;

pub use file::FileProbe;
pub use network::NetworkProbe;
pub use process::ProcessProbe;
pub use types::{Extras, RawConnection, RawFile, RawProcess, RawSample};

use crate::signal::Shutdown;
use edr_common::EventKind;
use std::time::Duration;
use thiserror::Error;

/// Probe-level failures.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe {probe} unavailable: {reason}")]
    Unavailable { probe: &'static str, reason: String },

    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl From<ProbeError> for edr_common::Error {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Unavailable { probe, reason } => edr_common::Error::ProbeUnavailable {
                probe: probe.to_string(),
                reason,
            },
            ProbeError::Watch(e) => edr_common::Error::ProbeUnavailable {
                probe: "file".to_string(),
                reason: e.to_string(),
            },
        }
    }
}

/// A source of raw observations.
pub trait Probe: Send {
    fn name(&self) -> &'static str;

    fn kind(&self) -> EventKind;

    /// Polling cadence.
    fn interval(&self) -> Duration;

    /// Acquire OS resources. An error is logged once by the runtime and the
    /// probe is still polled.
    fn start(&mut self) -> Result<(), ProbeError> {
        Ok(())
    }

    /// One polling pass.
    fn sample(&mut self) -> Vec<RawSample>;

    /// Block for at most `timeout` waiting for pushed observations.
    ///
    /// Returns `true` when [`Probe::drain_pushed`] has something to hand
    /// over. Poll-only probes just sleep, waking early on shutdown.
    fn wait_for_push(&mut self, timeout: Duration, shutdown: &Shutdown) -> bool {
        shutdown.wait_timeout(timeout);
        false
    }

    /// Take buffered pushed observations.
    fn drain_pushed(&mut self) -> Vec<RawSample> {
        Vec::new()
    }

    /// Release OS resources. Pushed observations received before the call
    /// remain available from [`Probe::drain_pushed`].
    fn stop(&mut self) {}
}

/// Logs a probe-level failure the first time it is seen.
#[derive(Debug, Default)]
pub(crate) struct OnceFlag {
    raised: bool,
}

impl OnceFlag {
    /// True on the first call after construction or [`OnceFlag::clear`].
    pub(crate) fn first(&mut self) -> bool {
        !std::mem::replace(&mut self.raised, true)
    }

    pub(crate) fn clear(&mut self) {
        self.raised = false;
    }
}

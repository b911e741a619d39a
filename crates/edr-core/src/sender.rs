//! Spool drain: the only consumer of pending entries.
//!
//! An entry leaves `pending/` only after the connection manager reports the
//! send as delivered, so a crash anywhere in a pass can at worst deliver an
//! entry twice.

use crate::connection::{ConnectionManager, SendError, Transport};
use crate::logging::{event_names, Stage};
use crate::signal::Wakeup;
use edr_common::EntryId;
use edr_spool::{Spool, SpoolError};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a drain pass ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DrainStop {
    /// Nothing left to send (skipped entries aside).
    Empty,
    NotConnected,
    /// The connection failed mid-pass; the failed entry stays pending.
    Transport(String),
    Shutdown,
    /// `pending/` could not be listed.
    ListFailed(String),
}

impl fmt::Display for DrainStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainStop::Empty => f.write_str("empty"),
            DrainStop::NotConnected => f.write_str("not connected"),
            DrainStop::Transport(e) => write!(f, "transport error: {e}"),
            DrainStop::Shutdown => f.write_str("shutdown"),
            DrainStop::ListFailed(e) => write!(f, "list failed: {e}"),
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub sent: usize,
    pub quarantined: usize,
    pub skipped: usize,
    pub stop: DrainStop,
}

impl DrainReport {
    fn new() -> Self {
        Self {
            sent: 0,
            quarantined: 0,
            skipped: 0,
            stop: DrainStop::Empty,
        }
    }

    fn finish(mut self, stop: DrainStop) -> Self {
        self.stop = stop;
        self
    }
}

/// Send pending entries oldest first until the spool is empty, the
/// connection drops, or `stop` is set.
///
/// Corrupt entries are quarantined by the spool and the pass continues.
/// Entries that fail to read for any other reason are skipped until the
/// next pass.
pub fn drain_pass<T: Transport>(
    spool: &Spool,
    conn: &ConnectionManager<T>,
    stop: &AtomicBool,
) -> DrainReport {
    let mut report = DrainReport::new();
    let mut skip: HashSet<EntryId> = HashSet::new();

    loop {
        if stop.load(Ordering::SeqCst) {
            return report.finish(DrainStop::Shutdown);
        }
        if !conn.is_connected() {
            return report.finish(DrainStop::NotConnected);
        }

        let batch: Vec<EntryId> = match spool.list_pending() {
            Ok(ids) => ids.into_iter().filter(|id| !skip.contains(id)).collect(),
            Err(e) => return report.finish(DrainStop::ListFailed(e.to_string())),
        };
        if batch.is_empty() {
            return report.finish(DrainStop::Empty);
        }

        for id in batch {
            if stop.load(Ordering::SeqCst) {
                return report.finish(DrainStop::Shutdown);
            }

            let entry = match spool.read(&id) {
                Ok(entry) => entry,
                // Removed by someone else since listing.
                Err(SpoolError::NotFound(_)) => continue,
                Err(SpoolError::Corrupt { .. }) => {
                    report.quarantined += 1;
                    continue;
                }
                Err(e) => {
                    warn!(entry_id = %id, error = %e, "spool entry unreadable, skipping");
                    report.skipped += 1;
                    skip.insert(id);
                    continue;
                }
            };

            match conn.send(&entry.event) {
                Ok(()) => {
                    report.sent += 1;
                    if let Err(e) = spool.remove(&id) {
                        // Delivered but still pending: it will be sent again.
                        warn!(
                            event = event_names::DRAIN_REMOVE_FAILED,
                            stage = %Stage::Send,
                            entry_id = %id,
                            error = %e,
                            "failed to remove delivered entry"
                        );
                        skip.insert(id);
                    }
                }
                Err(SendError::NotConnected) => {
                    return report.finish(DrainStop::NotConnected);
                }
                Err(SendError::Transport(e)) => {
                    return report.finish(DrainStop::Transport(e.to_string()));
                }
            }
        }
    }
}

/// Background thread running drain passes.
pub struct Sender {
    stop: Arc<AtomicBool>,
    wake: Wakeup,
    thread: Option<thread::JoinHandle<()>>,
}

impl Sender {
    /// Start draining every `interval` and whenever the connection manager
    /// raises its drain signal.
    pub fn spawn<T: Transport + 'static>(
        spool: Arc<Spool>,
        conn: Arc<ConnectionManager<T>>,
        interval: Duration,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let wake = conn.drain_signal();

        let thread = {
            let stop = Arc::clone(&stop);
            let wake = wake.clone();
            thread::Builder::new()
                .name("edr-sender".to_string())
                .spawn(move || sender_loop(&spool, &conn, &stop, &wake, interval))?
        };

        info!(interval_secs = interval.as_secs(), "sender started");
        Ok(Self {
            stop,
            wake,
            thread: Some(thread),
        })
    }

    /// Request an immediate pass.
    pub fn wake(&self) {
        self.wake.raise();
    }

    /// Finish the in-flight send, then stop. Pending entries stay on disk.
    pub fn stop(mut self) {
        self.shutdown();
        info!("sender stopped");
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.raise();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sender_loop<T: Transport>(
    spool: &Spool,
    conn: &ConnectionManager<T>,
    stop: &AtomicBool,
    wake: &Wakeup,
    interval: Duration,
) {
    while !stop.load(Ordering::SeqCst) {
        if conn.is_connected() {
            let report = drain_pass(spool, conn, stop);
            if report.sent + report.quarantined + report.skipped > 0 {
                info!(
                    event = event_names::DRAIN_PASS,
                    stage = %Stage::Send,
                    sent = report.sent,
                    quarantined = report.quarantined,
                    skipped = report.skipped,
                    stop = %report.stop,
                    "drain pass finished"
                );
            } else {
                debug!(stop = %report.stop, "drain pass idle");
            }
        }
        wake.wait_timeout(interval);
    }
}

//! In-process transport for exercising the delivery pipeline without a
//! network.
//!
//! A [`MemoryCollector`] is the remote end: it records every accepted frame
//! and can be made unreachable or told to fail after a number of frames.
//! Each [`MemoryTransport`] it hands out shares that state.

use super::transport::{Frame, Transport, TransportError};
use edr_common::CanonicalEvent;
use serde_json::Value;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct CollectorState {
    reachable: bool,
    /// Frames still accepted before the next injected failure.
    fail_after: Option<usize>,
    open_sessions: usize,
    session_open: bool,
    frames: Vec<Value>,
}

/// Remote end of [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryCollector {
    state: Arc<Mutex<CollectorState>>,
}

impl Default for MemoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CollectorState {
                reachable: true,
                fail_after: None,
                open_sessions: 0,
                session_open: false,
                frames: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            collector: self.clone(),
        }
    }

    /// An unreachable collector refuses connections and drops the current
    /// session.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.lock();
        state.reachable = reachable;
        if !reachable {
            state.session_open = false;
        }
    }

    /// Accept `frames` more frames, then fail the next one and drop the
    /// session. The failure fires once.
    pub fn fail_after(&self, frames: usize) {
        self.lock().fail_after = Some(frames);
    }

    /// Number of sessions opened so far.
    pub fn sessions(&self) -> usize {
        self.lock().open_sessions
    }

    /// Every accepted frame, registration included, in arrival order.
    pub fn frames(&self) -> Vec<Value> {
        self.lock().frames.clone()
    }

    pub fn registrations(&self) -> usize {
        self.lock()
            .frames
            .iter()
            .filter(|f| f["event"] == super::transport::REGISTER_CHANNEL)
            .count()
    }

    /// Events carried by accepted telemetry frames, in arrival order.
    pub fn events(&self) -> Vec<CanonicalEvent> {
        self.lock()
            .frames
            .iter()
            .filter(|f| f["event"] != super::transport::REGISTER_CHANNEL)
            .filter_map(|f| f["data"]["logs"].as_array().cloned())
            .flatten()
            .filter_map(|log| serde_json::from_value(log).ok())
            .collect()
    }
}

/// Transport whose peer is a [`MemoryCollector`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    collector: MemoryCollector,
}

impl Transport for MemoryTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.collector.lock();
        if !state.reachable {
            return Err(TransportError::Connect {
                addr: self.peer(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "collector unreachable"),
            });
        }
        state.session_open = true;
        state.open_sessions += 1;
        Ok(())
    }

    fn send_frame(&mut self, frame: &Frame<'_>) -> Result<(), TransportError> {
        let value = serde_json::to_value(frame)?;
        let mut state = self.collector.lock();
        if !state.session_open {
            return Err(TransportError::Closed);
        }
        match state.fail_after {
            Some(0) => {
                state.fail_after = None;
                state.session_open = false;
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "injected failure",
                )));
            }
            Some(n) => state.fail_after = Some(n - 1),
            None => {}
        }
        state.frames.push(value);
        Ok(())
    }

    fn close(&mut self) {
        self.collector.lock().session_open = false;
    }

    fn peer(&self) -> String {
        "memory".to_string()
    }
}

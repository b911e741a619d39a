//! Connection to the remote collector.
//!
//! [`ConnectionManager`] owns the transport and the state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!       ^              |            |
//!       +--------------+------------+   (failure, remote close, disconnect)
//! ```
//!
//! Transitions and sends happen under one mutex. The state is mirrored in
//! an atomic so [`ConnectionManager::is_connected`] never blocks behind a
//! slow send.

pub mod memory;
pub mod reconnect;
pub mod tcp;
pub mod transport;

pub use memory::{MemoryCollector, MemoryTransport};
pub use reconnect::{run_reconnect_loop, ReconnectPolicy};
pub use tcp::TcpTransport;
pub use transport::{Frame, FrameData, Transport, TransportError};

use crate::logging::{event_names, Stage};
use crate::signal::Wakeup;
use chrono::{DateTime, Utc};
use edr_common::{CanonicalEvent, HostIdentity};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{info, warn};

/// Transitions kept for inspection.
pub const TRANSITION_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            2 => ConnectionState::Connected,
            1 => ConnectionState::Connecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub at: DateTime<Utc>,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: String,
}

/// Counters since the manager was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub connects: u64,
    pub failed_attempts: u64,
    pub disconnects: u64,
    pub frames_sent: u64,
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("not connected to collector")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<SendError> for edr_common::Error {
    fn from(err: SendError) -> Self {
        match err {
            SendError::NotConnected => edr_common::Error::NotConnected,
            SendError::Transport(e) => edr_common::Error::Transport(e.to_string()),
        }
    }
}

struct Inner<T> {
    transport: T,
    transitions: VecDeque<Transition>,
    stats: ConnectionStats,
}

pub struct ConnectionManager<T: Transport> {
    inner: Mutex<Inner<T>>,
    state: AtomicU8,
    drain: Wakeup,
    registration: HostIdentity,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, registration: HostIdentity) -> Self {
        Self {
            inner: Mutex::new(Inner {
                transport,
                transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
                stats: ConnectionStats::default(),
            }),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            drain: Wakeup::new(),
            registration,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Raised after every successful connect.
    pub fn drain_signal(&self) -> Wakeup {
        self.drain.clone()
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.lock().transitions.iter().cloned().collect()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.lock().stats
    }

    fn transition(&self, inner: &mut Inner<T>, to: ConnectionState, reason: impl Into<String>) {
        let from = self.state();
        let reason = reason.into();
        self.state.store(to as u8, Ordering::Release);
        info!(
            event = event_names::CONN_TRANSITION,
            stage = %Stage::Connect,
            from = %from,
            to = %to,
            peer = %inner.transport.peer(),
            reason = %reason,
            "connection state changed"
        );
        if inner.transitions.len() == TRANSITION_HISTORY {
            inner.transitions.pop_front();
        }
        inner.transitions.push_back(Transition {
            at: Utc::now(),
            from,
            to,
            reason,
        });
    }

    /// One connection attempt: open, register, mark connected, wake the
    /// sender. Returns whether the manager is now connected.
    pub fn connect(&self) -> bool {
        let mut inner = self.lock();
        if self.is_connected() {
            return true;
        }

        self.transition(&mut inner, ConnectionState::Connecting, "connect attempt");
        let attempt = inner.transport.open().and_then(|()| {
            inner
                .transport
                .send_frame(&Frame::register(&self.registration))
        });

        match attempt {
            Ok(()) => {
                inner.stats.connects += 1;
                self.transition(&mut inner, ConnectionState::Connected, "registered");
                drop(inner);
                self.drain.raise();
                true
            }
            Err(e) => {
                inner.transport.close();
                inner.stats.failed_attempts += 1;
                warn!(
                    event = event_names::CONN_ATTEMPT_FAILED,
                    stage = %Stage::Connect,
                    peer = %inner.transport.peer(),
                    error = %e,
                    "connection attempt failed"
                );
                self.transition(&mut inner, ConnectionState::Disconnected, e.to_string());
                false
            }
        }
    }

    /// Transmit one event. A transport failure closes the connection.
    pub fn send(&self, event: &CanonicalEvent) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        let mut inner = self.lock();
        // Lost while waiting for the lock.
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }

        match inner.transport.send_frame(&Frame::telemetry(event)) {
            Ok(()) => {
                inner.stats.frames_sent += 1;
                Ok(())
            }
            Err(e) => {
                inner.transport.close();
                inner.stats.disconnects += 1;
                self.transition(
                    &mut inner,
                    ConnectionState::Disconnected,
                    format!("send failed: {e}"),
                );
                Err(SendError::Transport(e))
            }
        }
    }

    /// Close the connection. Always ends disconnected.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        inner.transport.close();
        if self.state() != ConnectionState::Disconnected {
            inner.stats.disconnects += 1;
            self.transition(&mut inner, ConnectionState::Disconnected, "disconnect requested");
        }
    }
}

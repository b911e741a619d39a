//! Transport seam and wire frames.
//!
//! A frame is one JSON object per line:
//! `{"event": "<channel>", "data": ...}`. Registration uses the `register`
//! channel with the host identity as data; telemetry frames carry
//! `{"hostname": ..., "logs": [event]}`.

use edr_common::{CanonicalEvent, HostIdentity};
use serde::Serialize;
use std::io;
use thiserror::Error;

/// Channel name of the registration frame.
pub const REGISTER_CHANNEL: &str = "register";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by collector")]
    Closed,

    #[error("collector rejected frame: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport is not open")]
    NotOpen,
}

/// Payload of a frame.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum FrameData<'a> {
    Register(&'a HostIdentity),
    Telemetry {
        hostname: &'a str,
        logs: [&'a CanonicalEvent; 1],
    },
}

/// One wire message.
#[derive(Debug, Serialize)]
pub struct Frame<'a> {
    pub event: &'static str,
    pub data: FrameData<'a>,
}

impl<'a> Frame<'a> {
    pub fn register(host: &'a HostIdentity) -> Self {
        Self {
            event: REGISTER_CHANNEL,
            data: FrameData::Register(host),
        }
    }

    pub fn telemetry(event: &'a CanonicalEvent) -> Self {
        Self {
            event: event.kind().channel(),
            data: FrameData::Telemetry {
                hostname: &event.hostname,
                logs: [event],
            },
        }
    }

    pub fn is_register(&self) -> bool {
        self.event == REGISTER_CHANNEL
    }

    /// Newline-terminated JSON encoding.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Byte pipe to the collector.
///
/// Calls are serialized by the connection manager; implementations need no
/// internal locking.
pub trait Transport: Send {
    /// Establish the underlying connection.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Deliver one frame. Returns once the frame counts as delivered for the
    /// configured acknowledgment mode.
    fn send_frame(&mut self, frame: &Frame<'_>) -> Result<(), TransportError>;

    /// Best-effort close. Must be safe to call when not open.
    fn close(&mut self);

    /// Peer description for log lines.
    fn peer(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use edr_common::{EventFields, PlatformTag, ProcessFields};
    use std::collections::BTreeMap;

    fn event() -> CanonicalEvent {
        CanonicalEvent {
            event_id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            hostname: "web-01".into(),
            os_type: PlatformTag::Linux,
            fields: EventFields::Process(ProcessFields {
                pid: 10,
                name: "nginx".into(),
                ..ProcessFields::default()
            }),
            os_variant_fields: BTreeMap::new(),
        }
    }

    #[test]
    fn test_telemetry_frame_shape() {
        let event = event();
        let bytes = Frame::telemetry(&event).encode().unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["event"], "process_logs");
        assert_eq!(value["data"]["hostname"], "web-01");
        assert_eq!(value["data"]["logs"][0]["fields"]["data"]["name"], "nginx");
        assert_eq!(
            value["data"]["logs"][0]["event_id"],
            event.event_id.to_string()
        );
    }

    #[test]
    fn test_register_frame_shape() {
        let host = HostIdentity {
            hostname: "web-01".into(),
            ..HostIdentity::default()
        };
        let frame = Frame::register(&host);
        assert!(frame.is_register());
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event"], "register");
        assert_eq!(value["data"]["hostname"], "web-01");
    }
}

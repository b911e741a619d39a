//! Newline-delimited JSON over TCP.
//!
//! In [`AckMode::Confirmed`] every frame must be answered by one line
//! `{"ack": true}` before the next is written. `{"ack": false, "error": ..}`
//! is a rejection. In [`AckMode::FireAndForget`] a completed write and
//! flush is delivery.

use super::transport::{Frame, Transport, TransportError};
use edr_config::{AckMode, CollectorSettings};
use serde::Deserialize;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown as SocketShutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Ack {
    ack: bool,
    #[serde(default)]
    error: Option<String>,
}

struct Stream {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

pub struct TcpTransport {
    addr: String,
    connect_timeout: Duration,
    io_timeout: Duration,
    ack_mode: AckMode,
    stream: Option<Stream>,
}

fn io_error(err: io::Error, during: &'static str) -> TransportError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout(during),
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => TransportError::Closed,
        _ => TransportError::Io(err),
    }
}

impl TcpTransport {
    pub fn new(
        addr: impl Into<String>,
        connect_timeout: Duration,
        io_timeout: Duration,
        ack_mode: AckMode,
    ) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            io_timeout,
            ack_mode,
            stream: None,
        }
    }

    pub fn from_settings(settings: &CollectorSettings) -> Self {
        Self::new(
            settings.address(),
            settings.connect_timeout(),
            settings.io_timeout(),
            settings.ack_mode,
        )
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>, TransportError> {
        let addrs: Vec<SocketAddr> = self
            .addr
            .to_socket_addrs()
            .map_err(|source| TransportError::Connect {
                addr: self.addr.clone(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::Connect {
                addr: self.addr.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing"),
            });
        }
        Ok(addrs)
    }

    fn connect_any(&self, addrs: &[SocketAddr]) -> Result<TcpStream, TransportError> {
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(TransportError::Connect {
            addr: self.addr.clone(),
            source: last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address tried")),
        })
    }

    fn await_ack(reader: &mut BufReader<TcpStream>) -> Result<(), TransportError> {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| io_error(e, "waiting for acknowledgment"))?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        let ack: Ack = serde_json::from_str(line.trim())
            .map_err(|e| TransportError::Protocol(format!("bad acknowledgment {:?}: {e}", line.trim())))?;
        if ack.ack {
            Ok(())
        } else {
            Err(TransportError::Rejected(
                ack.error.unwrap_or_else(|| "negative acknowledgment".to_string()),
            ))
        }
    }
}

impl Transport for TcpTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        self.close();
        let addrs = self.resolve()?;
        let stream = self.connect_any(&addrs)?;

        let timeout = Some(self.io_timeout).filter(|t| !t.is_zero());
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        stream.set_nodelay(true)?;

        let writer = stream.try_clone()?;
        self.stream = Some(Stream {
            reader: BufReader::new(stream),
            writer,
        });
        Ok(())
    }

    fn send_frame(&mut self, frame: &Frame<'_>) -> Result<(), TransportError> {
        let bytes = frame.encode()?;
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;

        stream
            .writer
            .write_all(&bytes)
            .and_then(|()| stream.writer.flush())
            .map_err(|e| io_error(e, "writing frame"))?;

        match self.ack_mode {
            AckMode::Confirmed => Self::await_ack(&mut stream.reader),
            AckMode::FireAndForget => Ok(()),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.writer.shutdown(SocketShutdown::Both);
        }
    }

    fn peer(&self) -> String {
        self.addr.clone()
    }
}

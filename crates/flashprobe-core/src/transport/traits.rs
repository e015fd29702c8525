//! Transport layer abstraction.
//!
//! A transport moves fixed-size frames and raw data phases between the host
//! and one programmer. Implementations serialize access internally, so every
//! method takes `&self`.

use std::time::Duration;

use thiserror::Error;

use super::endpoint::Endpoint;
use crate::protocol::Frame;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("No programmer at {0}")]
    EndpointNotFound(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn timeout(timeout: Duration) -> Self {
        TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Map an I/O error from a stream or USB reader onto the transport taxonomy.
    pub fn from_io(err: std::io::Error, timeout: Duration) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::timeout(timeout),
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected => TransportError::Disconnected,
            _ => TransportError::Io(err),
        }
    }
}

/// Byte-level connection to one programmer.
///
/// Implementations:
/// - `NusbTransport` for USB bulk endpoints
/// - `StreamTransport` for TCP and Unix sockets
/// - `EmulatedDevice` for an in-process programmer model
/// - `MockTransport` for scripted unit tests
pub trait Transport: Send + Sync {
    /// Send one request frame.
    fn send(&self, frame: &Frame) -> Result<(), TransportError>;

    /// Receive one reply frame, waiting at most `timeout`.
    fn receive(&self, timeout: Duration) -> Result<Frame, TransportError>;

    /// Send a host-to-device data phase.
    fn send_bulk(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive exactly `len` bytes of a device-to-host data phase.
    fn receive_bulk(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Release the connection. Further calls fail with `Disconnected`.
    fn close(&self);

    /// Check if the device is still reachable.
    fn is_connected(&self) -> bool;

    /// Where this connection points; `None` for in-process transports.
    fn endpoint(&self) -> Option<Endpoint>;
}

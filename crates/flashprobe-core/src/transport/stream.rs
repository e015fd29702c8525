//! Socket transport for network-attached and bridged programmers.

use std::io::{Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::endpoint::Endpoint;
use super::traits::{Transport, TransportError};
use crate::protocol::Frame;
use crate::protocol::constants::FRAME_SIZE;

/// Sockets reject a zero read timeout.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Socket {
    fn set_read_timeout(&self, timeout: Duration) -> std::io::Result<()> {
        match self {
            Socket::Tcp(s) => s.set_read_timeout(Some(timeout.max(MIN_TIMEOUT))),
            #[cfg(unix)]
            Socket::Unix(s) => s.set_read_timeout(Some(timeout.max(MIN_TIMEOUT))),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Socket::Tcp(s) => s.read_exact(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.read_exact(buf),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Socket::Tcp(s) => s.write_all(data).and_then(|_| s.flush()),
            #[cfg(unix)]
            Socket::Unix(s) => s.write_all(data).and_then(|_| s.flush()),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Socket::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            #[cfg(unix)]
            Socket::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }
}

/// Frames over a TCP or Unix stream socket, byte-for-byte as on USB.
pub struct StreamTransport {
    socket: Mutex<Socket>,
    endpoint: Endpoint,
    connected: AtomicBool,
}

impl StreamTransport {
    #[instrument(level = "info")]
    pub fn connect_tcp(host: &str, port: u16) -> Result<Self, TransportError> {
        let stream =
            TcpStream::connect((host, port)).map_err(|e| TransportError::OpenFailed(format!("{}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true)?;
        info!(host = %host, port = port, "Connected to network programmer");
        Ok(Self {
            socket: Mutex::new(Socket::Tcp(stream)),
            endpoint: Endpoint::Tcp {
                host: host.to_string(),
                port,
            },
            connected: AtomicBool::new(true),
        })
    }

    #[cfg(unix)]
    #[instrument(level = "info", skip(path), fields(path = %path.display()))]
    pub fn connect_unix(path: &Path) -> Result<Self, TransportError> {
        let stream =
            UnixStream::connect(path).map_err(|e| TransportError::OpenFailed(format!("{}: {}", path.display(), e)))?;
        info!("Connected to local socket");
        Ok(Self {
            socket: Mutex::new(Socket::Unix(stream)),
            endpoint: Endpoint::UnixSocket {
                path: path.to_path_buf(),
            },
            connected: AtomicBool::new(true),
        })
    }

    #[cfg(not(unix))]
    pub fn connect_unix(path: &Path) -> Result<Self, TransportError> {
        Err(TransportError::OpenFailed(format!(
            "{}: Unix sockets are not available on this platform",
            path.display()
        )))
    }

    fn read_exact(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let mut socket = self.socket.lock().map_err(|_| TransportError::Disconnected)?;
        socket.set_read_timeout(timeout)?;
        let mut buf = vec![0u8; len];
        socket.read_exact(&mut buf).map_err(|e| {
            let err = TransportError::from_io(e, timeout);
            if matches!(err, TransportError::Disconnected) {
                self.connected.store(false, Ordering::SeqCst);
            }
            err
        })?;
        Ok(buf)
    }

    fn write_all(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let mut socket = self.socket.lock().map_err(|_| TransportError::Disconnected)?;
        socket.write_all(data).map_err(|e| {
            let err = TransportError::from_io(e, Duration::ZERO);
            if matches!(err, TransportError::Disconnected) {
                self.connected.store(false, Ordering::SeqCst);
            }
            err
        })
    }
}

impl Transport for StreamTransport {
    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.write_all(frame.as_bytes())
    }

    fn receive(&self, timeout: Duration) -> Result<Frame, TransportError> {
        let bytes = self.read_exact(FRAME_SIZE, timeout)?;
        Frame::from_slice(&bytes).map_err(|e| TransportError::ReadFailed(e.to_string()))
    }

    fn send_bulk(&self, data: &[u8]) -> Result<(), TransportError> {
        self.write_all(data)?;
        debug!(bytes_written = data.len(), "Data phase sent");
        Ok(())
    }

    fn receive_bulk(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let data = self.read_exact(len, timeout)?;
        debug!(bytes_read = len, "Data phase received");
        Ok(data)
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst)
            && let Ok(socket) = self.socket.lock()
        {
            socket.shutdown();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> Option<Endpoint> {
        Some(self.endpoint.clone())
    }
}

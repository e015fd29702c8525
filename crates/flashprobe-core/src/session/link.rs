//! Request/reply exchange over a transport, with packet events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::error::Error;
use crate::events::{FlashEvent, FlashObserver, PacketDirection};
use crate::protocol::{Command, Frame, Operation, ProtocolError, Reply, Status};
use crate::transport::{Endpoint, Transport, TransportError};

/// Bytes of each packet copied into events.
const EVENT_PREVIEW: usize = 32;

/// Stale frames discarded while resynchronizing before giving up.
const MAX_STALE_FRAMES: usize = 16;

/// A decoded reply plus its data phase.
#[derive(Debug, Clone)]
pub struct Response {
    pub reply: Reply,
    pub data: Vec<u8>,
}

impl Response {
    /// First inline payload byte; status registers and features live here.
    pub fn byte(&self) -> u8 {
        self.reply.payload[0]
    }
}

/// One request in flight at a time; the reply must echo the request.
///
/// A receive that times out leaves the link stale: the device may still
/// answer the abandoned request. The next exchange first sends a `Ping` and
/// discards everything up to its echo.
pub struct Link {
    transport: Box<dyn Transport>,
    exchange: Mutex<()>,
    stale: AtomicBool,
    observer: Arc<dyn FlashObserver>,
}

impl Link {
    pub fn new(transport: Box<dyn Transport>, observer: Arc<dyn FlashObserver>) -> Self {
        Self {
            transport,
            exchange: Mutex::new(()),
            stale: AtomicBool::new(false),
            observer,
        }
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.transport.endpoint()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn close(&self) {
        self.transport.close();
    }

    pub fn request(&self, op: &Operation, timeout: Duration) -> Result<Response, Error> {
        self.exchange(op, None, timeout)
    }

    /// Send a request followed by its host-to-device data phase.
    pub fn request_with_data(&self, op: &Operation, data: &[u8], timeout: Duration) -> Result<Response, Error> {
        self.exchange(op, Some(data), timeout)
    }

    /// Whether the next exchange will resynchronize first.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    fn exchange(&self, op: &Operation, data: Option<&[u8]>, timeout: Duration) -> Result<Response, Error> {
        let _guard = self.exchange.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_stale() {
            self.resync(timeout)?;
        }
        let command = op.command();

        let frame = op.encode();
        self.transport.send(&frame)?;
        self.packet(PacketDirection::Tx, command.name(), frame.as_bytes());
        if let Some(data) = data {
            self.transport.send_bulk(data)?;
            self.packet(PacketDirection::Tx, "Data", data);
        }

        let frame = self.receive_frame(timeout)?;
        self.packet(PacketDirection::Rx, command.name(), frame.as_bytes());
        let reply = Reply::decode(&frame, command)?;

        // The data phase is drained even for failed commands so the next
        // reply starts on a frame boundary.
        let data = self.receive_data(reply.data_len, timeout)?;

        match reply.status {
            Status::Ok => {
                debug!(command = %command, data_len = data.len(), "Reply");
                Ok(Response { reply, data })
            }
            Status::InvalidCommand => Err(ProtocolError::UnknownCommand(command.id()).into()),
            status => Err(ProtocolError::DeviceStatus { command, status }.into()),
        }
    }

    fn receive_frame(&self, timeout: Duration) -> Result<Frame, TransportError> {
        self.transport.receive(timeout).inspect_err(|e| self.mark_stale(e))
    }

    fn receive_data(&self, len: u32, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let data = self
            .transport
            .receive_bulk(len as usize, timeout)
            .inspect_err(|e| self.mark_stale(e))?;
        self.packet(PacketDirection::Rx, "Data", &data);
        Ok(data)
    }

    fn mark_stale(&self, err: &TransportError) {
        if matches!(err, TransportError::Timeout { .. }) {
            self.stale.store(true, Ordering::Release);
        }
    }

    /// Drop late replies to abandoned requests. Stops at the echo of a fresh
    /// `Ping`; any other frame is discarded together with its data phase.
    fn resync(&self, timeout: Duration) -> Result<(), Error> {
        let ping = Operation::Ping.encode();
        self.transport.send(&ping)?;
        self.packet(PacketDirection::Tx, Command::Ping.name(), ping.as_bytes());

        let mut discarded = 0;
        loop {
            let frame = self.receive_frame(timeout)?;
            let data_len = LittleEndian::read_u32(&frame.as_bytes()[2..6]);
            self.receive_data(data_len, timeout)?;
            if frame.command_id() == Command::Ping.id() {
                self.packet(PacketDirection::Rx, Command::Ping.name(), frame.as_bytes());
                self.stale.store(false, Ordering::Release);
                debug!(discarded, "Link resynchronized");
                return Ok(());
            }
            warn!(command = %format!("0x{:02X}", frame.command_id()), data_len, "Discarding stale reply");
            discarded += 1;
            if discarded > MAX_STALE_FRAMES {
                return Err(ProtocolError::Desync {
                    expected: Command::Ping.id(),
                    actual: frame.command_id(),
                }
                .into());
            }
        }
    }

    fn packet(&self, direction: PacketDirection, packet_type: &str, data: &[u8]) {
        self.observer.on_event(&FlashEvent::Packet {
            direction,
            packet_type: packet_type.to_string(),
            length: data.len(),
            data: Some(data.iter().take(EVENT_PREVIEW).cloned().collect()),
        });
    }
}

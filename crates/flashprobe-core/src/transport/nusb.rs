//! nusb-based USB transport implementation.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, In, Out, TransferError};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, trace};

use super::endpoint::Endpoint;
use super::traits::{Transport, TransportError};
use crate::protocol::Frame;
use crate::protocol::constants::{EP_IN, EP_OUT, FRAME_SIZE, PROGRAMMER_PID, PROGRAMMER_VID};

/// Timeout for OUT transfers; the programmer drains its FIFO continuously.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Largest single IN request.
const MAX_IN_REQUEST: usize = 64 * 1024;

/// A programmer found on the USB bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub bus: String,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    pub product: Option<String>,
}

impl DeviceInfo {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::Usb {
            bus: self.bus.clone(),
            address: self.address,
        }
    }
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{:04X}:{:04X}] {}",
            self.endpoint(),
            self.vendor_id,
            self.product_id,
            self.product.as_deref().unwrap_or("programmer")
        )?;
        if let Some(serial) = &self.serial {
            write!(f, " (S/N {})", serial)?;
        }
        Ok(())
    }
}

/// Enumerate attached programmers.
#[instrument(level = "debug")]
pub fn scan_devices() -> Result<Vec<DeviceInfo>, TransportError> {
    let devices = list_devices()
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?
        .filter(|d| d.vendor_id() == PROGRAMMER_VID && d.product_id() == PROGRAMMER_PID)
        .map(|d| DeviceInfo {
            bus: d.bus_id().to_string(),
            address: d.device_address(),
            vendor_id: d.vendor_id(),
            product_id: d.product_id(),
            serial: d.serial_number().map(str::to_string),
            product: d.product_string().map(str::to_string),
        })
        .collect::<Vec<_>>();
    debug!(count = devices.len(), "USB scan complete");
    Ok(devices)
}

struct UsbPipes {
    out_ep: nusb::Endpoint<Bulk, Out>,
    in_ep: nusb::Endpoint<Bulk, In>,
    /// Bytes received beyond what the last read consumed.
    rx: Vec<u8>,
}

impl UsbPipes {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let completion = self.out_ep.transfer_blocking(Buffer::from(data.to_vec()), WRITE_TIMEOUT);
        completion.into_result().map_err(|e| map_transfer_error(e, WRITE_TIMEOUT))?;
        trace!(bytes_written = data.len(), "Bulk OUT");
        Ok(())
    }

    /// Read until `len` bytes are buffered, then hand them out.
    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let max_packet = self.in_ep.max_packet_size().max(1);
        while self.rx.len() < len {
            let wanted = (len - self.rx.len()).min(MAX_IN_REQUEST);
            let request_len = wanted.div_ceil(max_packet) * max_packet;
            let mut buf = Buffer::new(request_len);
            buf.set_requested_len(request_len);
            let completion = self.in_ep.transfer_blocking(buf, timeout);
            let data = completion.into_result().map_err(|e| map_transfer_error(e, timeout))?;
            trace!(bytes_read = data.len(), "Bulk IN");
            self.rx.extend_from_slice(&data);
        }
        let rest = self.rx.split_off(len);
        Ok(std::mem::replace(&mut self.rx, rest))
    }
}

fn map_transfer_error(err: TransferError, timeout: Duration) -> TransportError {
    match err {
        TransferError::Cancelled => TransportError::timeout(timeout),
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::ReadFailed(other.to_string()),
    }
}

/// nusb-based USB transport.
pub struct NusbTransport {
    _interface: Interface,
    pipes: Mutex<UsbPipes>,
    bus: String,
    address: u8,
    connected: AtomicBool,
}

impl NusbTransport {
    /// Open the first attached programmer.
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == PROGRAMMER_VID && d.product_id() == PROGRAMMER_PID)
            .ok_or(TransportError::DeviceNotFound {
                vid: PROGRAMMER_VID,
                pid: PROGRAMMER_PID,
            })?;
        Self::open_device_info(device_info)
    }

    /// Open the programmer at a specific bus position.
    #[instrument(level = "info")]
    pub fn open_at(bus: &str, address: u8) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.bus_id() == bus && d.device_address() == address)
            .ok_or_else(|| TransportError::EndpointNotFound(format!("usb:{}:{}", bus, address)))?;
        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        info!(
            vendor_id = %format!("{:04X}", device_info.vendor_id()),
            product_id = %format!("{:04X}", device_info.product_id()),
            bus = %device_info.bus_id(),
            address = device_info.device_address(),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface = device
            .claim_interface(0)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: 0,
                message: e.to_string(),
            })?;

        let out_ep = interface
            .endpoint::<Bulk, Out>(EP_OUT)
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: 0,
                message: format!("bulk OUT 0x{:02X}: {}", EP_OUT, e),
            })?;
        let in_ep = interface
            .endpoint::<Bulk, In>(EP_IN)
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: 0,
                message: format!("bulk IN 0x{:02X}: {}", EP_IN, e),
            })?;

        info!(
            in_ep = %format!("0x{:02X}", EP_IN),
            out_ep = %format!("0x{:02X}", EP_OUT),
            "Device opened successfully"
        );

        Ok(Self {
            _interface: interface,
            pipes: Mutex::new(UsbPipes {
                out_ep,
                in_ep,
                rx: Vec::new(),
            }),
            bus: device_info.bus_id().to_string(),
            address: device_info.device_address(),
            connected: AtomicBool::new(true),
        })
    }

    fn with_pipes<T>(&self, f: impl FnOnce(&mut UsbPipes) -> Result<T, TransportError>) -> Result<T, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let mut pipes = self.pipes.lock().map_err(|_| TransportError::Disconnected)?;
        let result = f(&mut pipes);
        if let Err(TransportError::Disconnected) = &result {
            self.connected.store(false, Ordering::SeqCst);
        }
        result
    }
}

impl Transport for NusbTransport {
    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.with_pipes(|p| p.write(frame.as_bytes()))
    }

    fn receive(&self, timeout: Duration) -> Result<Frame, TransportError> {
        let bytes = self.with_pipes(|p| p.read_exact(FRAME_SIZE, timeout))?;
        Frame::from_slice(&bytes).map_err(|e| TransportError::ReadFailed(e.to_string()))
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn send_bulk(&self, data: &[u8]) -> Result<(), TransportError> {
        self.with_pipes(|p| p.write(data))?;
        debug!(bytes_written = data.len(), "Write complete");
        Ok(())
    }

    #[instrument(skip(self))]
    fn receive_bulk(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let data = self.with_pipes(|p| p.read_exact(len, timeout))?;
        debug!(bytes_read = data.len(), "Read complete");
        Ok(data)
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst)
            && let Ok(mut pipes) = self.pipes.lock()
        {
            pipes.out_ep.cancel_all();
            pipes.in_ep.cancel_all();
            pipes.rx.clear();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> Option<Endpoint> {
        Some(Endpoint::Usb {
            bus: self.bus.clone(),
            address: self.address,
        })
    }
}

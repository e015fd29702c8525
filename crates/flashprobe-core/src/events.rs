//! Event system for UI decoupling.
//!
//! Lets a CLI, GUI or test harness follow a session (state changes,
//! progress, frame traffic) without the core knowing who is listening.

use std::fmt;

use crate::chip::FlashInterface;
use crate::session::DeviceState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Long-running operation a progress or retry event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Identify,
    Dump,
    Erase,
    Write,
    Unlock,
    SelectLun,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Identify => write!(f, "Identify"),
            OperationKind::Dump => write!(f, "Dump"),
            OperationKind::Erase => write!(f, "Erase"),
            OperationKind::Write => write!(f, "Write"),
            OperationKind::Unlock => write!(f, "Unlock"),
            OperationKind::SelectLun => write!(f, "Select LUN"),
        }
    }
}

/// Events emitted by a flash session.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Transport opened and programmer answered.
    DeviceConnected { endpoint: String, firmware: String },
    /// Transport closed or lost.
    DeviceDisconnected,
    /// Session state changed.
    StateChanged { from: DeviceState, to: DeviceState },
    /// Chip identification finished.
    ChipIdentified {
        interface: FlashInterface,
        manufacturer: String,
        model: String,
        resolved: bool,
    },
    /// Progress update; `percent` never decreases within one operation.
    Progress {
        operation: OperationKind,
        percent: u8,
        current: u64,
        total: u64,
    },
    /// A chunk failed transiently and is being retried.
    Retry {
        operation: OperationKind,
        offset: u64,
        attempt: u32,
        reason: String,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Frame or data phase on the wire.
    Packet {
        direction: PacketDirection,
        packet_type: String,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Operation stopped on request; partial results were returned.
    Cancelled { operation: OperationKind, offset: u64 },
    /// Operation finished successfully.
    Complete { operation: OperationKind },
}

/// Wire direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { endpoint, firmware } => {
                tracing::info!(endpoint = %endpoint, firmware = %firmware, "Device connected");
            }
            FlashEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            FlashEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            FlashEvent::ChipIdentified {
                interface,
                manufacturer,
                model,
                resolved,
            } => {
                if *resolved {
                    tracing::info!(interface = %interface, "Chip identified: {} {}", manufacturer, model);
                } else {
                    tracing::warn!(interface = %interface, "Chip not resolved, using {} {}", manufacturer, model);
                }
            }
            FlashEvent::Progress {
                operation,
                percent,
                current,
                total,
            } => {
                tracing::debug!(
                    operation = %operation,
                    progress = %format!("{}%", percent),
                    current = current,
                    total = total,
                    "Progress"
                );
            }
            FlashEvent::Retry {
                operation,
                offset,
                attempt,
                reason,
            } => {
                tracing::warn!(
                    operation = %operation,
                    offset = %format!("0x{:X}", offset),
                    attempt = attempt,
                    "Retrying: {}",
                    reason
                );
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::Packet {
                direction,
                packet_type,
                length,
                ..
            } => {
                tracing::trace!(
                    dir = %direction,
                    type_ = %packet_type,
                    len = length,
                    "Packet"
                );
            }
            FlashEvent::Cancelled { operation, offset } => {
                tracing::warn!(operation = %operation, offset = %format!("0x{:X}", offset), "Cancelled");
            }
            FlashEvent::Complete { operation } => {
                tracing::info!(operation = %operation, "Operation complete");
            }
        }
    }
}

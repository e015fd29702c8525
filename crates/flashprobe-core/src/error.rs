//! Aggregate error type.

use thiserror::Error;

use crate::chip::{ChipError, FlashInterface, ProtectionBits, UfsLunType};
use crate::ecc::EccError;
use crate::protocol::ProtocolError;
use crate::session::{DeviceState, PartialDump};
use crate::transport::TransportError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("Erase failed at 0x{address:X}: {reason}")]
    EraseFailed { address: u64, reason: String },

    #[error("Write failed at page {page}: {reason}")]
    WriteFailed { page: u64, reason: String },

    #[error("Verify failed at page {page}")]
    WriteVerifyFailed { page: u64 },

    #[error("Range 0x{start:X}..0x{end:X} exceeds capacity 0x{capacity:X}")]
    OutOfRange { start: u64, end: u64, capacity: u64 },

    #[error("Chip erase not confirmed")]
    NotConfirmed,

    #[error("Protection still set after unlock: {remaining}")]
    UnlockIncomplete { remaining: ProtectionBits },

    #[error("Cannot resume: {0}")]
    ResumeTargetMismatch(String),

    #[error("{operation} not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: DeviceState,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Address 0x{address:X} is not aligned to 0x{alignment:X}")]
    UnalignedAddress { address: u64, alignment: u64 },

    #[error("Length {len} is not a multiple of {unit}")]
    UnalignedLength { len: u64, unit: u64 },

    #[error("Page size {page_size} is not a multiple of the {unit}-byte block unit")]
    InvalidPageSize { page_size: u32, unit: u32 },

    #[error("LUN {lun}: {reason}")]
    InvalidLun { lun: UfsLunType, reason: &'static str },

    #[error("Interface {interface}: {reason}")]
    InvalidInterface { interface: FlashInterface, reason: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Chip(#[from] ChipError),

    #[error(transparent)]
    Ecc(#[from] EccError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Dump aborted at offset 0x{:X}: {source}", .partial.state.next_offset())]
    DumpAborted {
        partial: Box<PartialDump>,
        source: Box<Error>,
    },

    #[error("Not connected")]
    NotConnected,
}

impl Error {
    /// Read chunks may be repeated after a timeout or a busy reply.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(TransportError::Timeout { .. }) => true,
            Error::Protocol(ProtocolError::DeviceStatus { status, .. }) => status.is_transient(),
            _ => false,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Transport(TransportError::Disconnected) | Error::NotConnected => true,
            Error::DumpAborted { source, .. } => source.is_disconnect(),
            _ => false,
        }
    }

    /// Data gathered before a dump stopped, if any.
    pub fn partial_dump(&self) -> Option<&PartialDump> {
        match self {
            Error::DumpAborted { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

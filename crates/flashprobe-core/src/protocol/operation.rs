//! Typed host operations and their frame encoding.
//!
//! Every variant maps to exactly one [`Command`]. Arguments are packed
//! little-endian into the 63-byte argument block, in field order.

use std::io::Cursor;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use super::command::Command;
use super::constants::ARG_SIZE;
use super::frame::{Frame, ProtocolError};
use crate::chip::FlashInterface;

/// Page-oriented NAND transfer: `count` pages of `page_size + spare_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub page: u32,
    pub count: u16,
    pub page_size: u16,
    pub spare_size: u16,
}

impl PageSpan {
    /// Bytes carried by the data phase for this span.
    pub fn transfer_len(&self) -> usize {
        self.count as usize * (self.page_size as usize + self.spare_size as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Ping,
    GetVersion,
    GetCapabilities,
    Reset,
    SetInterface { interface: FlashInterface },

    NandReadId { address: u8 },
    NandReadParamPage,
    NandReadPages(PageSpan),
    NandProgramPages(PageSpan),
    NandEraseBlock { page: u32 },

    SpiNandReadId,
    SpiNandGetFeature { register: u8 },
    SpiNandSetFeature { register: u8, value: u8 },
    SpiNandReadPages(PageSpan),
    SpiNandProgramPages(PageSpan),
    SpiNandEraseBlock { page: u32 },

    EmmcInit,
    EmmcReadCid,
    EmmcReadExtCsd,
    EmmcReadBlocks { lba: u32, count: u32 },
    EmmcWriteBlocks { lba: u32, count: u32 },
    EmmcErase { start_lba: u32, end_lba: u32 },

    NorReadJedecId,
    NorRead { address: u32, len: u32 },
    NorPageProgram { address: u32, len: u32 },
    NorSectorErase { address: u32 },
    NorBlockErase { address: u32 },
    NorChipErase,
    NorReadStatus1,
    NorReadStatus2,
    NorWriteStatus1 { value: u8 },
    NorWriteStatus2 { value: u8 },
    NorWriteEnable,

    UfsInit,
    UfsReadDescriptor { idn: u8, index: u8 },
    UfsRead { lun: u8, lba: u32, blocks: u32 },
    UfsWrite { lun: u8, lba: u32, blocks: u32 },
    UfsSelectLun { lun: u8 },
}

/// Sequential little-endian writer over the argument block.
struct Args {
    buf: [u8; ARG_SIZE],
    pos: usize,
}

impl Args {
    fn new() -> Self {
        Self {
            buf: [0u8; ARG_SIZE],
            pos: 0,
        }
    }

    fn u8(mut self, v: u8) -> Self {
        self.buf[self.pos] = v;
        self.pos += 1;
        self
    }

    fn u16(mut self, v: u16) -> Self {
        LittleEndian::write_u16(&mut self.buf[self.pos..], v);
        self.pos += 2;
        self
    }

    fn u32(mut self, v: u32) -> Self {
        LittleEndian::write_u32(&mut self.buf[self.pos..], v);
        self.pos += 4;
        self
    }

    fn span(self, s: &PageSpan) -> Self {
        self.u32(s.page)
            .u16(s.count)
            .u16(s.page_size)
            .u16(s.spare_size)
    }
}

impl Operation {
    pub fn command(&self) -> Command {
        match self {
            Operation::Ping => Command::Ping,
            Operation::GetVersion => Command::GetVersion,
            Operation::GetCapabilities => Command::GetCapabilities,
            Operation::Reset => Command::Reset,
            Operation::SetInterface { .. } => Command::SetInterface,
            Operation::NandReadId { .. } => Command::NandReadId,
            Operation::NandReadParamPage => Command::NandReadParamPage,
            Operation::NandReadPages(_) => Command::NandReadPage,
            Operation::NandProgramPages(_) => Command::NandWritePage,
            Operation::NandEraseBlock { .. } => Command::NandErase,
            Operation::SpiNandReadId => Command::SpiNandReadId,
            Operation::SpiNandGetFeature { .. } => Command::SpiNandGetFeature,
            Operation::SpiNandSetFeature { .. } => Command::SpiNandSetFeature,
            Operation::SpiNandReadPages(_) => Command::SpiNandPageRead,
            Operation::SpiNandProgramPages(_) => Command::SpiNandProgramExec,
            Operation::SpiNandEraseBlock { .. } => Command::SpiNandBlockErase,
            Operation::EmmcInit => Command::EmmcInit,
            Operation::EmmcReadCid => Command::EmmcReadCid,
            Operation::EmmcReadExtCsd => Command::EmmcReadExtCsd,
            Operation::EmmcReadBlocks { .. } => Command::EmmcReadMultiple,
            Operation::EmmcWriteBlocks { .. } => Command::EmmcWriteMultiple,
            Operation::EmmcErase { .. } => Command::EmmcErase,
            Operation::NorReadJedecId => Command::NorReadJedecId,
            Operation::NorRead { .. } => Command::NorRead,
            Operation::NorPageProgram { .. } => Command::NorPageProgram,
            Operation::NorSectorErase { .. } => Command::NorSectorErase,
            Operation::NorBlockErase { .. } => Command::NorBlockErase64K,
            Operation::NorChipErase => Command::NorChipErase,
            Operation::NorReadStatus1 => Command::NorReadStatus1,
            Operation::NorReadStatus2 => Command::NorReadStatus2,
            Operation::NorWriteStatus1 { .. } => Command::NorWriteStatus1,
            Operation::NorWriteStatus2 { .. } => Command::NorWriteStatus2,
            Operation::NorWriteEnable => Command::NorWriteEnable,
            Operation::UfsInit => Command::UfsInit,
            Operation::UfsReadDescriptor { .. } => Command::UfsReadDescriptor,
            Operation::UfsRead { .. } => Command::UfsRead10,
            Operation::UfsWrite { .. } => Command::UfsWrite10,
            Operation::UfsSelectLun { .. } => Command::UfsSelectLun,
        }
    }

    /// Encode into a request frame. Total for every variant.
    pub fn encode(&self) -> Frame {
        let args = match self {
            Operation::SetInterface { interface } => Args::new().u8(interface.as_u8()),
            Operation::NandReadId { address } => Args::new().u8(*address),
            Operation::NandReadPages(s)
            | Operation::NandProgramPages(s)
            | Operation::SpiNandReadPages(s)
            | Operation::SpiNandProgramPages(s) => Args::new().span(s),
            Operation::NandEraseBlock { page } | Operation::SpiNandEraseBlock { page } => {
                Args::new().u32(*page)
            }
            Operation::SpiNandGetFeature { register } => Args::new().u8(*register),
            Operation::SpiNandSetFeature { register, value } => {
                Args::new().u8(*register).u8(*value)
            }
            Operation::EmmcReadBlocks { lba, count } | Operation::EmmcWriteBlocks { lba, count } => {
                Args::new().u32(*lba).u32(*count)
            }
            Operation::EmmcErase { start_lba, end_lba } => Args::new().u32(*start_lba).u32(*end_lba),
            Operation::NorRead { address, len } | Operation::NorPageProgram { address, len } => {
                Args::new().u32(*address).u32(*len)
            }
            Operation::NorSectorErase { address } | Operation::NorBlockErase { address } => {
                Args::new().u32(*address)
            }
            Operation::NorWriteStatus1 { value } | Operation::NorWriteStatus2 { value } => {
                Args::new().u8(*value)
            }
            Operation::UfsReadDescriptor { idn, index } => Args::new().u8(*idn).u8(*index),
            Operation::UfsRead { lun, lba, blocks } | Operation::UfsWrite { lun, lba, blocks } => {
                Args::new().u8(*lun).u32(*lba).u32(*blocks)
            }
            Operation::UfsSelectLun { lun } => Args::new().u8(*lun),
            Operation::Ping
            | Operation::GetVersion
            | Operation::GetCapabilities
            | Operation::Reset
            | Operation::NandReadParamPage
            | Operation::SpiNandReadId
            | Operation::EmmcInit
            | Operation::EmmcReadCid
            | Operation::EmmcReadExtCsd
            | Operation::NorReadJedecId
            | Operation::NorChipErase
            | Operation::NorReadStatus1
            | Operation::NorReadStatus2
            | Operation::NorWriteEnable
            | Operation::UfsInit => Args::new(),
        };
        Frame::request(self.command(), args.buf)
    }

    /// Decode a request frame, as the programmer firmware does.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let id = frame.command_id();
        let command = Command::from_u8(id).ok_or(ProtocolError::UnknownCommand(id))?;
        let mut r = Cursor::new(frame.args());
        let malformed = |e: std::io::Error| ProtocolError::MalformedPayload {
            command: id,
            reason: e.to_string(),
        };
        let span = |r: &mut Cursor<&[u8]>| -> Result<PageSpan, ProtocolError> {
            Ok(PageSpan {
                page: r.read_u32::<LittleEndian>().map_err(malformed)?,
                count: r.read_u16::<LittleEndian>().map_err(malformed)?,
                page_size: r.read_u16::<LittleEndian>().map_err(malformed)?,
                spare_size: r.read_u16::<LittleEndian>().map_err(malformed)?,
            })
        };

        let op = match command {
            Command::Ping => Operation::Ping,
            Command::GetVersion => Operation::GetVersion,
            Command::GetCapabilities => Operation::GetCapabilities,
            Command::Reset => Operation::Reset,
            Command::SetInterface => {
                let raw = r.read_u8().map_err(malformed)?;
                let interface =
                    FlashInterface::from_u8(raw).ok_or_else(|| ProtocolError::MalformedPayload {
                        command: id,
                        reason: format!("unknown interface {}", raw),
                    })?;
                Operation::SetInterface { interface }
            }
            Command::NandReadId => Operation::NandReadId {
                address: r.read_u8().map_err(malformed)?,
            },
            Command::NandReadParamPage => Operation::NandReadParamPage,
            Command::NandReadPage => Operation::NandReadPages(span(&mut r)?),
            Command::NandWritePage => Operation::NandProgramPages(span(&mut r)?),
            Command::NandErase => Operation::NandEraseBlock {
                page: r.read_u32::<LittleEndian>().map_err(malformed)?,
            },
            Command::SpiNandReadId => Operation::SpiNandReadId,
            Command::SpiNandGetFeature => Operation::SpiNandGetFeature {
                register: r.read_u8().map_err(malformed)?,
            },
            Command::SpiNandSetFeature => Operation::SpiNandSetFeature {
                register: r.read_u8().map_err(malformed)?,
                value: r.read_u8().map_err(malformed)?,
            },
            Command::SpiNandPageRead => Operation::SpiNandReadPages(span(&mut r)?),
            Command::SpiNandProgramExec => Operation::SpiNandProgramPages(span(&mut r)?),
            Command::SpiNandBlockErase => Operation::SpiNandEraseBlock {
                page: r.read_u32::<LittleEndian>().map_err(malformed)?,
            },
            Command::EmmcInit => Operation::EmmcInit,
            Command::EmmcReadCid => Operation::EmmcReadCid,
            Command::EmmcReadExtCsd => Operation::EmmcReadExtCsd,
            Command::EmmcReadMultiple => Operation::EmmcReadBlocks {
                lba: r.read_u32::<LittleEndian>().map_err(malformed)?,
                count: r.read_u32::<LittleEndian>().map_err(malformed)?,
            },
            Command::EmmcWriteMultiple => Operation::EmmcWriteBlocks {
                lba: r.read_u32::<LittleEndian>().map_err(malformed)?,
                count: r.read_u32::<LittleEndian>().map_err(malformed)?,
            },
            Command::EmmcErase => Operation::EmmcErase {
                start_lba: r.read_u32::<LittleEndian>().map_err(malformed)?,
                end_lba: r.read_u32::<LittleEndian>().map_err(malformed)?,
            },
            Command::NorReadJedecId => Operation::NorReadJedecId,
            Command::NorRead => Operation::NorRead {
                address: r.read_u32::<LittleEndian>().map_err(malformed)?,
                len: r.read_u32::<LittleEndian>().map_err(malformed)?,
            },
            Command::NorPageProgram => Operation::NorPageProgram {
                address: r.read_u32::<LittleEndian>().map_err(malformed)?,
                len: r.read_u32::<LittleEndian>().map_err(malformed)?,
            },
            Command::NorSectorErase => Operation::NorSectorErase {
                address: r.read_u32::<LittleEndian>().map_err(malformed)?,
            },
            Command::NorBlockErase64K => Operation::NorBlockErase {
                address: r.read_u32::<LittleEndian>().map_err(malformed)?,
            },
            Command::NorChipErase => Operation::NorChipErase,
            Command::NorReadStatus1 => Operation::NorReadStatus1,
            Command::NorReadStatus2 => Operation::NorReadStatus2,
            Command::NorWriteStatus1 => Operation::NorWriteStatus1 {
                value: r.read_u8().map_err(malformed)?,
            },
            Command::NorWriteStatus2 => Operation::NorWriteStatus2 {
                value: r.read_u8().map_err(malformed)?,
            },
            Command::NorWriteEnable => Operation::NorWriteEnable,
            Command::UfsInit => Operation::UfsInit,
            Command::UfsReadDescriptor => Operation::UfsReadDescriptor {
                idn: r.read_u8().map_err(malformed)?,
                index: r.read_u8().map_err(malformed)?,
            },
            Command::UfsRead10 => Operation::UfsRead {
                lun: r.read_u8().map_err(malformed)?,
                lba: r.read_u32::<LittleEndian>().map_err(malformed)?,
                blocks: r.read_u32::<LittleEndian>().map_err(malformed)?,
            },
            Command::UfsWrite10 => Operation::UfsWrite {
                lun: r.read_u8().map_err(malformed)?,
                lba: r.read_u32::<LittleEndian>().map_err(malformed)?,
                blocks: r.read_u32::<LittleEndian>().map_err(malformed)?,
            },
            Command::UfsSelectLun => Operation::UfsSelectLun {
                lun: r.read_u8().map_err(malformed)?,
            },
        };
        Ok(op)
    }

    /// Length of the host-to-device data phase that must follow this request.
    ///
    /// `UfsWrite` reports 0: its length is `blocks` times the LUN block size,
    /// which only the caller and the device know.
    pub fn outbound_len(&self) -> usize {
        match self {
            Operation::NandProgramPages(s) | Operation::SpiNandProgramPages(s) => s.transfer_len(),
            Operation::EmmcWriteBlocks { count, .. } => {
                *count as usize * super::constants::SECTOR_BYTES as usize
            }
            Operation::NorPageProgram { len, .. } => *len as usize,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> PageSpan {
        PageSpan {
            page: 0x0001_0203,
            count: 64,
            page_size: 2048,
            spare_size: 64,
        }
    }

    fn every_operation() -> Vec<Operation> {
        vec![
            Operation::Ping,
            Operation::GetVersion,
            Operation::GetCapabilities,
            Operation::Reset,
            Operation::SetInterface {
                interface: FlashInterface::SpiNor,
            },
            Operation::NandReadId { address: 0x20 },
            Operation::NandReadParamPage,
            Operation::NandReadPages(span()),
            Operation::NandProgramPages(span()),
            Operation::NandEraseBlock { page: 640 },
            Operation::SpiNandReadId,
            Operation::SpiNandGetFeature { register: 0xA0 },
            Operation::SpiNandSetFeature {
                register: 0xA0,
                value: 0x38,
            },
            Operation::SpiNandReadPages(span()),
            Operation::SpiNandProgramPages(span()),
            Operation::SpiNandEraseBlock { page: 128 },
            Operation::EmmcInit,
            Operation::EmmcReadCid,
            Operation::EmmcReadExtCsd,
            Operation::EmmcReadBlocks {
                lba: 4096,
                count: 256,
            },
            Operation::EmmcWriteBlocks { lba: 8, count: 4 },
            Operation::EmmcErase {
                start_lba: 0,
                end_lba: 1023,
            },
            Operation::NorReadJedecId,
            Operation::NorRead {
                address: 0x00FF_0000,
                len: 16384,
            },
            Operation::NorPageProgram {
                address: 0x100,
                len: 256,
            },
            Operation::NorSectorErase { address: 0x1000 },
            Operation::NorBlockErase { address: 0x10000 },
            Operation::NorChipErase,
            Operation::NorReadStatus1,
            Operation::NorReadStatus2,
            Operation::NorWriteStatus1 { value: 0x1C },
            Operation::NorWriteStatus2 { value: 0x02 },
            Operation::NorWriteEnable,
            Operation::UfsInit,
            Operation::UfsReadDescriptor { idn: 2, index: 0xC4 },
            Operation::UfsRead {
                lun: 1,
                lba: 77,
                blocks: 8,
            },
            Operation::UfsWrite {
                lun: 0,
                lba: 3,
                blocks: 1,
            },
            Operation::UfsSelectLun { lun: 2 },
        ]
    }

    #[test]
    fn test_every_operation_round_trips() {
        for op in every_operation() {
            let frame = op.encode();
            assert_eq!(frame.command_id(), op.command().id());
            assert_eq!(Operation::from_frame(&frame).unwrap(), op, "{:?}", op);
        }
    }

    #[test]
    fn test_every_command_has_an_operation() {
        let covered: Vec<Command> = every_operation().iter().map(|o| o.command()).collect();
        for cmd in Command::ALL {
            assert!(covered.contains(cmd), "no operation for {}", cmd);
        }
    }

    #[test]
    fn test_arguments_are_little_endian() {
        let frame = Operation::NorRead {
            address: 0x1234_5678,
            len: 0x100,
        }
        .encode();
        assert_eq!(
            &frame.as_bytes()[..9],
            &[0x62, 0x78, 0x56, 0x34, 0x12, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut bytes = [0u8; 64];
        bytes[0] = 0xB3;
        let err = Operation::from_frame(&Frame::new(bytes)).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownCommand(0xB3));
    }

    #[test]
    fn test_bad_interface_is_malformed() {
        let mut bytes = *Operation::SetInterface {
            interface: FlashInterface::Ufs,
        }
        .encode()
        .as_bytes();
        bytes[1] = 0x77;
        assert!(matches!(
            Operation::from_frame(&Frame::new(bytes)),
            Err(ProtocolError::MalformedPayload { command: 0x09, .. })
        ));
    }

    #[test]
    fn test_outbound_len() {
        assert_eq!(Operation::NandProgramPages(span()).outbound_len(), 64 * 2112);
        assert_eq!(Operation::EmmcWriteBlocks { lba: 0, count: 2 }.outbound_len(), 1024);
        assert_eq!(Operation::NorRead { address: 0, len: 9 }.outbound_len(), 0);
    }
}

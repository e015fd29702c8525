//! Command-ID namespace and reply status codes.

use std::fmt;

use super::constants::*;

/// Contiguous command-ID ranges, one per subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Core,
    ParallelNand,
    SpiNand,
    Emmc,
    SpiNor,
    Ufs,
    BadBlock,
    Scripting,
    Ai,
    MultiDevice,
    Hardware,
    Cloud,
    Platform,
}

impl Subsystem {
    /// Subsystem owning a command ID. Every byte value belongs to exactly one range.
    pub fn of(id: u8) -> Self {
        match id {
            0x00..=0x0F => Subsystem::Core,
            0x10..=0x1F => Subsystem::ParallelNand,
            0x20..=0x3F => Subsystem::SpiNand,
            0x40..=0x5F => Subsystem::Emmc,
            0x60..=0x7F => Subsystem::SpiNor,
            0x80..=0x8F => Subsystem::Ufs,
            0x90..=0x9F => Subsystem::BadBlock,
            0xA0..=0xAF => Subsystem::Scripting,
            0xB0..=0xBF => Subsystem::Ai,
            0xC0..=0xCF => Subsystem::MultiDevice,
            0xD0..=0xDF => Subsystem::Hardware,
            0xE0..=0xEF => Subsystem::Cloud,
            0xF0..=0xFF => Subsystem::Platform,
        }
    }
}

macro_rules! commands {
    ($($name:ident = $id:literal),+ $(,)?) => {
        /// Command IDs understood by the programmer firmware.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Command {
            $($name = $id),+
        }

        impl Command {
            /// All known commands, in ID order.
            pub const ALL: &'static [Command] = &[$(Command::$name),+];

            pub fn from_u8(id: u8) -> Option<Self> {
                match id {
                    $($id => Some(Command::$name),)+
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Command::$name => stringify!($name)),+
                }
            }
        }
    };
}

commands! {
    Ping = 0x01,
    GetVersion = 0x03,
    GetCapabilities = 0x04,
    Reset = 0x08,
    SetInterface = 0x09,

    NandReadPage = 0x12,
    NandWritePage = 0x13,
    NandReadId = 0x14,
    NandErase = 0x15,
    NandReadParamPage = 0x17,

    SpiNandReadId = 0x20,
    SpiNandGetFeature = 0x22,
    SpiNandSetFeature = 0x23,
    SpiNandPageRead = 0x24,
    SpiNandProgramExec = 0x29,
    SpiNandBlockErase = 0x2A,

    EmmcInit = 0x40,
    EmmcReadCid = 0x41,
    EmmcReadExtCsd = 0x43,
    EmmcReadMultiple = 0x45,
    EmmcWriteMultiple = 0x47,
    EmmcErase = 0x48,

    NorReadJedecId = 0x60,
    NorRead = 0x62,
    NorPageProgram = 0x66,
    NorSectorErase = 0x67,
    NorBlockErase64K = 0x69,
    NorChipErase = 0x6A,
    NorReadStatus1 = 0x6B,
    NorReadStatus2 = 0x6C,
    NorWriteStatus1 = 0x6E,
    NorWriteStatus2 = 0x6F,
    NorWriteEnable = 0x71,

    UfsInit = 0x80,
    UfsReadDescriptor = 0x81,
    UfsRead10 = 0x83,
    UfsWrite10 = 0x85,
    UfsSelectLun = 0x87,
}

impl Command {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn subsystem(self) -> Subsystem {
        Subsystem::of(self.id())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), self.id())
    }
}

/// Reply status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Busy,
    Timeout,
    InvalidCommand,
}

impl Status {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            STATUS_OK => Some(Status::Ok),
            STATUS_ERROR => Some(Status::Error),
            STATUS_BUSY => Some(Status::Busy),
            STATUS_TIMEOUT => Some(Status::Timeout),
            STATUS_INVALID_COMMAND => Some(Status::InvalidCommand),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Status::Ok => STATUS_OK,
            Status::Error => STATUS_ERROR,
            Status::Busy => STATUS_BUSY,
            Status::Timeout => STATUS_TIMEOUT,
            Status::InvalidCommand => STATUS_INVALID_COMMAND,
        }
    }

    /// Busy and timeout replies may succeed when the same request is repeated.
    pub fn is_transient(self) -> bool {
        matches!(self, Status::Busy | Status::Timeout)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Error => write!(f, "ERROR"),
            Status::Busy => write!(f, "BUSY"),
            Status::Timeout => write!(f, "TIMEOUT"),
            Status::InvalidCommand => write!(f, "INVALID_COMMAND"),
        }
    }
}

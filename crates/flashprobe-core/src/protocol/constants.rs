//! Protocol constants shared by host and programmer firmware.

/// USB vendor ID of the programmer.
pub const PROGRAMMER_VID: u16 = 0xC0DE;
/// USB product ID of the programmer.
pub const PROGRAMMER_PID: u16 = 0xCAFE;

/// Bulk OUT endpoint address.
pub const EP_OUT: u8 = 0x01;
/// Bulk IN endpoint address.
pub const EP_IN: u8 = 0x81;

/// Size of every request and reply frame.
pub const FRAME_SIZE: usize = 64;
/// Argument bytes following the command ID in a request frame.
pub const ARG_SIZE: usize = FRAME_SIZE - 1;
/// Reply header: command echo, status, u32 bulk length.
pub const REPLY_HEADER_SIZE: usize = 6;
/// Inline payload bytes carried by a reply frame.
pub const INLINE_PAYLOAD_SIZE: usize = FRAME_SIZE - REPLY_HEADER_SIZE;

/// Default number of pages requested per read chunk.
pub const DEFAULT_CHUNK_PAGES: u32 = 64;
/// Default receive timeout for a single reply.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
/// Default receive timeout for erase commands.
pub const DEFAULT_ERASE_TIMEOUT_MS: u64 = 30_000;

/// eMMC and UFS logical block unit used for address translation.
pub const SECTOR_BYTES: u32 = 512;

/// ONFI parameter page length.
pub const ONFI_PARAM_PAGE_SIZE: usize = 256;
/// eMMC EXT_CSD register length.
pub const EXT_CSD_SIZE: usize = 512;

/// UFS descriptor IDNs.
pub const UFS_DESC_DEVICE: u8 = 0x00;
pub const UFS_DESC_UNIT: u8 = 0x02;

/// SPI NAND block-lock feature register.
pub const SPI_NAND_FEATURE_BLOCK_LOCK: u8 = 0xA0;

/// Status codes returned in byte 1 of every reply.
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERROR: u8 = 0x01;
pub const STATUS_BUSY: u8 = 0x02;
pub const STATUS_TIMEOUT: u8 = 0x03;
pub const STATUS_INVALID_COMMAND: u8 = 0xFF;

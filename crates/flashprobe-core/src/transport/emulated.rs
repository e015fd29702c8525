//! In-process programmer emulator.
//!
//! Decodes request frames exactly as the firmware does and answers them from
//! simulated chips, so the full session stack can run without hardware. Every
//! interface is populated at once; `SetInterface` picks which one answers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use super::endpoint::Endpoint;
use super::traits::{Transport, TransportError};
use crate::chip::emmc::{Cid, ExtCsd};
use crate::chip::ufs::{DeviceDescriptor, encode_unit_descriptor};
use crate::chip::{DeviceCapabilities, FlashInterface, OnfiParams, ProtectionBits, UfsLun, UfsLunType};
use crate::protocol::constants::{
    SECTOR_BYTES, SPI_NAND_FEATURE_BLOCK_LOCK, STATUS_ERROR, STATUS_INVALID_COMMAND, UFS_DESC_DEVICE,
    UFS_DESC_UNIT,
};
use crate::protocol::{Command, Frame, Operation, PageSpan, ProtocolError, Reply, Status, Subsystem};

const STORAGE_CHUNK: u64 = 4096;
const NOR_PAGE: u64 = 256;
const NOR_SECTOR: u64 = 4096;
const NOR_BLOCK: u64 = 64 * 1024;
/// SPI NAND lock register bits that take part in protection.
const SPI_NAND_LOCK_BITS: u8 = 0x3E;

/// Raw NAND geometry and identity.
#[derive(Debug, Clone)]
pub struct NandModel {
    pub id: Vec<u8>,
    pub page_size: u32,
    pub oob_size: u32,
    pub pages_per_block: u32,
    pub blocks: u32,
    /// Answered to `NandReadParamPage` when present.
    pub onfi: Option<OnfiParams>,
    /// Blocks shipped with a zeroed bad-block marker.
    pub bad_blocks: Vec<u32>,
    /// Initial block-lock register (SPI NAND only).
    pub block_lock: u8,
}

impl NandModel {
    /// Samsung K9F1G08U0B, 128 MiB, 2 KiB pages.
    pub fn parallel() -> Self {
        Self {
            id: vec![0xEC, 0xF1, 0x00, 0x95, 0x40],
            page_size: 2048,
            oob_size: 64,
            pages_per_block: 64,
            blocks: 1024,
            onfi: None,
            bad_blocks: Vec::new(),
            block_lock: 0,
        }
    }

    /// GigaDevice GD5F1GQ4UB, 128 MiB, 2 KiB pages with 128-byte spare.
    pub fn spi() -> Self {
        Self {
            id: vec![0xC8, 0xD1],
            oob_size: 128,
            ..Self::parallel()
        }
    }
}

#[derive(Debug, Clone)]
pub struct NorModel {
    pub jedec_id: [u8; 3],
    pub capacity: u64,
    pub sr1: u8,
    pub sr2: u8,
}

impl Default for NorModel {
    /// Winbond W25Q128JV, unprotected.
    fn default() -> Self {
        Self {
            jedec_id: [0xEF, 0x40, 0x18],
            capacity: 16 * 1024 * 1024,
            sr1: 0,
            sr2: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmmcModel {
    pub cid: Cid,
    pub ext_csd: ExtCsd,
}

impl Default for EmmcModel {
    /// Samsung part, 256 MiB user area.
    fn default() -> Self {
        Self {
            cid: Cid {
                manufacturer_id: 0x15,
                oem_id: 0x01,
                product_name: "KLM8G1".into(),
                revision: 0x10,
                serial: 0x1234_5678,
            },
            ext_csd: ExtCsd {
                revision: 8,
                sector_count: 256 * 1024 * 1024 / SECTOR_BYTES,
                boot_size_mult: 32,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct UfsModel {
    pub descriptor: DeviceDescriptor,
    pub luns: Vec<UfsLun>,
}

impl Default for UfsModel {
    /// Samsung UFS 3.1 with a 64 MiB user LUN, two boot LUNs and RPMB.
    fn default() -> Self {
        let lun = |lun_type, capacity_bytes, block_size| UfsLun {
            lun_type,
            capacity_bytes,
            block_size,
            enabled: true,
            write_protected: false,
        };
        Self {
            descriptor: DeviceDescriptor {
                manufacturer_id: 0x01CE,
                spec_version: 0x0310,
            },
            luns: vec![
                lun(UfsLunType::UserData, 64 * 1024 * 1024, 4096),
                lun(UfsLunType::BootA, 4 * 1024 * 1024, 4096),
                lun(UfsLunType::BootB, 4 * 1024 * 1024, 4096),
                lun(UfsLunType::Rpmb, 128 * 1024, 256),
            ],
        }
    }
}

/// Faults injected into the next matching commands.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Read commands that get no reply at all.
    pub dropped_replies: u32,
    /// Read commands answered with `Busy`.
    pub busy_replies: u32,
    /// Drop the link after this many more commands.
    pub disconnect_after: Option<u32>,
    /// Echo the wrong command ID on the next reply.
    pub desync_next: bool,
    /// Every erase command fails.
    pub fail_erase: bool,
    /// Data offsets whose lowest bit flips after being programmed.
    pub weak_bits: Vec<u64>,
}

/// Everything the emulated programmer carries.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub capabilities: DeviceCapabilities,
    pub firmware: [u8; 3],
    pub parallel_nand: NandModel,
    pub spi_nand: NandModel,
    pub nor: NorModel,
    pub emmc: EmmcModel,
    pub ufs: UfsModel,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                parallel_nand: true,
                spi_nand: true,
                spi_nor: true,
                emmc: true,
                ufs: true,
                hardware_ecc: true,
                high_speed_usb: true,
                ..Default::default()
            },
            firmware: [1, 2, 0],
            parallel_nand: NandModel::parallel(),
            spi_nand: NandModel::spi(),
            nor: NorModel::default(),
            emmc: EmmcModel::default(),
            ufs: UfsModel::default(),
        }
    }
}

/// Sparse flash array; untouched regions read back as the erased value.
struct FlashArray {
    len: u64,
    erased: u8,
    /// NAND and NOR can only clear bits when programming.
    program_clears: bool,
    chunks: HashMap<u64, Box<[u8]>>,
}

impl FlashArray {
    fn new(len: u64, erased: u8, program_clears: bool) -> Self {
        Self {
            len,
            erased,
            program_clears,
            chunks: HashMap::new(),
        }
    }

    fn contains(&self, offset: u64, len: u64) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len)
    }

    /// Visit `(chunk index, column, done, n)` for every chunk a range touches.
    fn walk(offset: u64, len: usize, mut f: impl FnMut(u64, usize, usize, usize)) {
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let col = (pos % STORAGE_CHUNK) as usize;
            let n = (STORAGE_CHUNK as usize - col).min(len - done);
            f(pos / STORAGE_CHUNK, col, done, n);
            done += n;
        }
    }

    fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![self.erased; len];
        Self::walk(offset, len, |idx, col, done, n| {
            if let Some(chunk) = self.chunks.get(&idx) {
                out[done..done + n].copy_from_slice(&chunk[col..col + n]);
            }
        });
        out
    }

    fn program(&mut self, offset: u64, data: &[u8]) {
        let erased = self.erased;
        let clears = self.program_clears;
        let chunks = &mut self.chunks;
        Self::walk(offset, data.len(), |idx, col, done, n| {
            let chunk = chunks
                .entry(idx)
                .or_insert_with(|| vec![erased; STORAGE_CHUNK as usize].into_boxed_slice());
            for (dst, src) in chunk[col..col + n].iter_mut().zip(&data[done..done + n]) {
                *dst = if clears { *dst & *src } else { *src };
            }
        });
    }

    /// Unconditional store, used to seed contents.
    fn load(&mut self, offset: u64, data: &[u8]) {
        let clears = std::mem::replace(&mut self.program_clears, false);
        self.program(offset, data);
        self.program_clears = clears;
    }

    fn erase(&mut self, offset: u64, len: u64) {
        let erased = self.erased;
        let chunks = &mut self.chunks;
        Self::walk(offset, len as usize, |idx, col, _, n| {
            if col == 0 && n == STORAGE_CHUNK as usize {
                chunks.remove(&idx);
            } else if let Some(chunk) = chunks.get_mut(&idx) {
                chunk[col..col + n].fill(erased);
            }
        });
    }

    fn flip_bit(&mut self, offset: u64, bit: u8) {
        let mut byte = self.read(offset, 1);
        byte[0] ^= 1 << (bit & 7);
        self.load(offset, &byte);
    }
}

struct NandChip {
    model: NandModel,
    array: FlashArray,
    lock: u8,
}

impl NandChip {
    fn new(model: NandModel) -> Self {
        let stride = (model.page_size + model.oob_size) as u64;
        let len = stride * model.pages_per_block as u64 * model.blocks as u64;
        let mut chip = Self {
            lock: model.block_lock,
            array: FlashArray::new(len, 0xFF, true),
            model,
        };
        for block in chip.model.bad_blocks.clone() {
            let page = block as u64 * chip.model.pages_per_block as u64;
            let marker = chip.raw_offset(page) + chip.model.page_size as u64;
            chip.array.load(marker, &[0x00]);
        }
        chip
    }

    fn stride(&self) -> u64 {
        (self.model.page_size + self.model.oob_size) as u64
    }

    fn total_pages(&self) -> u64 {
        self.model.pages_per_block as u64 * self.model.blocks as u64
    }

    fn raw_offset(&self, page: u64) -> u64 {
        page * self.stride()
    }

    /// Raw offset of a byte in the data area, ignoring spare bytes.
    fn data_offset(&self, offset: u64) -> u64 {
        let page_size = self.model.page_size as u64;
        self.raw_offset(offset / page_size) + offset % page_size
    }

    fn check_span(&self, span: &PageSpan) -> Result<(), Status> {
        let fits = (span.page as u64) + span.count as u64 <= self.total_pages();
        if span.page_size as u32 != self.model.page_size || span.spare_size as u32 > self.model.oob_size || !fits {
            return Err(Status::Error);
        }
        Ok(())
    }

    fn read_span(&self, span: &PageSpan) -> Result<Vec<u8>, Status> {
        self.check_span(span)?;
        let width = span.page_size as usize + span.spare_size as usize;
        let mut out = Vec::with_capacity(span.transfer_len());
        for page in span.page as u64..span.page as u64 + span.count as u64 {
            out.extend_from_slice(&self.array.read(self.raw_offset(page), width));
        }
        Ok(out)
    }

    fn program_span(&mut self, span: &PageSpan, data: &[u8]) -> Result<(), Status> {
        self.check_span(span)?;
        if data.len() != span.transfer_len() {
            return Err(Status::Error);
        }
        let width = span.page_size as usize + span.spare_size as usize;
        for (i, page_data) in data.chunks(width).enumerate() {
            let page = span.page as u64 + i as u64;
            if self.locked(page) {
                return Err(Status::Error);
            }
            let raw = self.raw_offset(page);
            self.array.program(raw, page_data);
        }
        Ok(())
    }

    fn erase_block(&mut self, page: u32) -> Result<(), Status> {
        let ppb = self.model.pages_per_block as u64;
        let first = page as u64 / ppb * ppb;
        if first >= self.total_pages() || self.locked(first) {
            return Err(Status::Error);
        }
        let (raw, len) = (self.raw_offset(first), self.stride() * ppb);
        self.array.erase(raw, len);
        Ok(())
    }

    fn locked(&self, page: u64) -> bool {
        let capacity = self.total_pages() * self.model.page_size as u64;
        let offset = page * self.model.page_size as u64;
        ProtectionBits::from_spi_nand_lock(self.lock)
            .protected_range(capacity)
            .is_some_and(|r| r.contains(&offset))
    }
}

struct NorChip {
    model: NorModel,
    array: FlashArray,
}

impl NorChip {
    fn new(model: NorModel) -> Self {
        Self {
            array: FlashArray::new(model.capacity, 0xFF, true),
            model,
        }
    }

    fn write_enabled(&self) -> bool {
        self.model.sr1 & ProtectionBits::SR1_WEL != 0
    }

    fn clear_wel(&mut self) {
        self.model.sr1 &= !ProtectionBits::SR1_WEL;
    }

    fn protected(&self, offset: u64, len: u64) -> bool {
        ProtectionBits::from_status(self.model.sr1, self.model.sr2)
            .protected_range(self.model.capacity)
            .is_some_and(|r| offset < r.end && r.start < offset + len)
    }

    /// Common gate for program and erase: WEL set, in range, not protected.
    fn modify(&mut self, offset: u64, len: u64) -> Result<(), Status> {
        let allowed = self.write_enabled() && self.array.contains(offset, len) && !self.protected(offset, len);
        self.clear_wel();
        if allowed { Ok(()) } else { Err(Status::Error) }
    }
}

struct UfsUnit {
    lun: UfsLun,
    array: FlashArray,
}

/// What a command produces besides its status.
enum Answer {
    Empty,
    Inline(Vec<u8>),
    Data(Vec<u8>),
}

enum Outgoing {
    Frame(Frame),
    Data(Vec<u8>),
}

struct DeviceModel {
    capabilities: DeviceCapabilities,
    firmware: [u8; 3],
    interface: Option<FlashInterface>,
    parallel_nand: NandChip,
    spi_nand: NandChip,
    nor: NorChip,
    emmc: EmmcModel,
    emmc_array: FlashArray,
    ufs_descriptor: DeviceDescriptor,
    ufs_units: Vec<UfsUnit>,
    selected_lun: u8,
    faults: FaultPlan,
    connected: bool,
    outbox: VecDeque<Outgoing>,
    pending_write: Option<Operation>,
    log: Vec<Operation>,
}

impl DeviceModel {
    fn new(config: EmulatorConfig) -> Self {
        let emmc_len = config.emmc.ext_csd.capacity_bytes();
        Self {
            capabilities: config.capabilities,
            firmware: config.firmware,
            interface: None,
            parallel_nand: NandChip::new(config.parallel_nand),
            spi_nand: NandChip::new(config.spi_nand),
            nor: NorChip::new(config.nor),
            emmc_array: FlashArray::new(emmc_len, 0x00, false),
            emmc: config.emmc,
            ufs_descriptor: config.ufs.descriptor,
            ufs_units: config
                .ufs
                .luns
                .into_iter()
                .map(|lun| UfsUnit {
                    array: FlashArray::new(lun.capacity_bytes, 0x00, false),
                    lun,
                })
                .collect(),
            selected_lun: UfsLunType::UserData.lun_id(),
            faults: FaultPlan::default(),
            connected: true,
            outbox: VecDeque::new(),
            pending_write: None,
            log: Vec::new(),
        }
    }

    fn unit(&self, lun: u8) -> Option<&UfsUnit> {
        self.ufs_units.iter().find(|u| u.lun.lun_type.lun_id() == lun)
    }

    fn unit_mut(&mut self, lun: u8) -> Option<&mut UfsUnit> {
        self.ufs_units.iter_mut().find(|u| u.lun.lun_type.lun_id() == lun)
    }

    /// Handle one request frame.
    fn on_frame(&mut self, frame: &Frame) {
        let op = match Operation::from_frame(frame) {
            Ok(op) => op,
            Err(err) => {
                debug!(error = %err, "Emulator rejected frame");
                let status = match err {
                    ProtocolError::UnknownCommand(_) => STATUS_INVALID_COMMAND,
                    _ => STATUS_ERROR,
                };
                let mut bytes = [0u8; crate::protocol::constants::FRAME_SIZE];
                bytes[0] = frame.command_id();
                bytes[1] = status;
                self.outbox.push_back(Outgoing::Frame(Frame::new(bytes)));
                return;
            }
        };
        trace!(op = ?op, "Emulator command");
        self.log.push(op);

        if let Some(remaining) = self.faults.disconnect_after.as_mut() {
            if *remaining == 0 {
                self.connected = false;
                self.outbox.clear();
                return;
            }
            *remaining -= 1;
        }

        if is_write(&op) {
            self.pending_write = Some(op);
            return;
        }

        if is_read(&op) {
            if self.faults.dropped_replies > 0 {
                self.faults.dropped_replies -= 1;
                return;
            }
            if self.faults.busy_replies > 0 {
                self.faults.busy_replies -= 1;
                self.reply(op.command(), Err(Status::Busy));
                return;
            }
        }

        let result = self.execute(&op);
        self.reply(op.command(), result);
    }

    fn on_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let op = self
            .pending_write
            .take()
            .ok_or_else(|| TransportError::WriteFailed("data phase without a pending write".into()))?;
        let result = self.execute_write(&op, data).map(|_| Answer::Empty);
        self.reply(op.command(), result);
        Ok(())
    }

    fn reply(&mut self, command: Command, result: Result<Answer, Status>) {
        let (reply, data) = match result {
            Ok(Answer::Empty) => (Reply::ok(command), None),
            Ok(Answer::Inline(bytes)) => (Reply::ok(command).with_payload(&bytes), None),
            Ok(Answer::Data(bytes)) => (Reply::ok(command).with_data_len(bytes.len() as u32), Some(bytes)),
            Err(status) => (Reply::new(command, status), None),
        };

        if std::mem::take(&mut self.faults.desync_next) {
            let wrong = if command == Command::Ping {
                Command::GetVersion
            } else {
                Command::Ping
            };
            self.outbox
                .push_back(Outgoing::Frame(Reply::new(wrong, reply.status).encode()));
            return;
        }

        self.outbox.push_back(Outgoing::Frame(reply.encode()));
        if let Some(bytes) = data {
            self.outbox.push_back(Outgoing::Data(bytes));
        }
    }

    fn execute(&mut self, op: &Operation) -> Result<Answer, Status> {
        if let Some(required) = interface_of(op)
            && self.interface != Some(required)
        {
            return Err(Status::Error);
        }

        match *op {
            Operation::Ping => Ok(Answer::Inline(b"PONG".to_vec())),
            Operation::GetVersion => Ok(Answer::Inline(self.firmware.to_vec())),
            Operation::GetCapabilities => Ok(Answer::Inline(self.capabilities.to_bitmap().to_le_bytes().to_vec())),
            Operation::Reset => {
                self.pending_write = None;
                self.interface = None;
                Ok(Answer::Empty)
            }
            Operation::SetInterface { interface } => {
                if !self.capabilities.supports(interface) {
                    return Err(Status::Error);
                }
                self.interface = Some(interface);
                Ok(Answer::Empty)
            }

            Operation::NandReadId { address: 0x00 } => Ok(Answer::Data(self.parallel_nand.model.id.clone())),
            Operation::NandReadId { address: 0x20 } => match self.parallel_nand.model.onfi {
                Some(_) => Ok(Answer::Data(b"ONFI".to_vec())),
                None => Err(Status::Error),
            },
            Operation::NandReadId { .. } => Err(Status::Error),
            Operation::NandReadParamPage => self
                .parallel_nand
                .model
                .onfi
                .as_ref()
                .map(|p| Answer::Data(p.to_bytes()))
                .ok_or(Status::Error),
            Operation::NandReadPages(span) => self.parallel_nand.read_span(&span).map(Answer::Data),
            Operation::NandEraseBlock { page } => {
                self.check_erase()?;
                self.parallel_nand.erase_block(page).map(|_| Answer::Empty)
            }

            Operation::SpiNandReadId => Ok(Answer::Data(self.spi_nand.model.id.clone())),
            Operation::SpiNandGetFeature { register } => match register {
                SPI_NAND_FEATURE_BLOCK_LOCK => Ok(Answer::Inline(vec![self.spi_nand.lock])),
                0xB0 | 0xC0 => Ok(Answer::Inline(vec![0x00])),
                _ => Err(Status::Error),
            },
            Operation::SpiNandSetFeature { register, value } => match register {
                SPI_NAND_FEATURE_BLOCK_LOCK => {
                    self.spi_nand.lock = value;
                    Ok(Answer::Empty)
                }
                0xB0 => Ok(Answer::Empty),
                _ => Err(Status::Error),
            },
            Operation::SpiNandReadPages(span) => self.spi_nand.read_span(&span).map(Answer::Data),
            Operation::SpiNandEraseBlock { page } => {
                self.check_erase()?;
                self.spi_nand.erase_block(page).map(|_| Answer::Empty)
            }

            Operation::EmmcInit => Ok(Answer::Empty),
            Operation::EmmcReadCid => Ok(Answer::Data(self.emmc.cid.to_bytes().to_vec())),
            Operation::EmmcReadExtCsd => Ok(Answer::Data(self.emmc.ext_csd.to_bytes())),
            Operation::EmmcReadBlocks { lba, count } => {
                let (offset, len) = sectors(lba, count);
                if !self.emmc_array.contains(offset, len) {
                    return Err(Status::Error);
                }
                Ok(Answer::Data(self.emmc_array.read(offset, len as usize)))
            }
            Operation::EmmcErase { start_lba, end_lba } => {
                self.check_erase()?;
                if end_lba < start_lba {
                    return Err(Status::Error);
                }
                let (offset, len) = sectors(start_lba, end_lba - start_lba + 1);
                if !self.emmc_array.contains(offset, len) {
                    return Err(Status::Error);
                }
                self.emmc_array.erase(offset, len);
                Ok(Answer::Empty)
            }

            Operation::NorReadJedecId => Ok(Answer::Data(self.nor.model.jedec_id.to_vec())),
            Operation::NorRead { address, len } => {
                if !self.nor.array.contains(address as u64, len as u64) {
                    return Err(Status::Error);
                }
                Ok(Answer::Data(self.nor.array.read(address as u64, len as usize)))
            }
            Operation::NorWriteEnable => {
                self.nor.model.sr1 |= ProtectionBits::SR1_WEL;
                Ok(Answer::Empty)
            }
            Operation::NorSectorErase { address } => self.nor_erase(address as u64, NOR_SECTOR),
            Operation::NorBlockErase { address } => self.nor_erase(address as u64, NOR_BLOCK),
            Operation::NorChipErase => {
                self.check_erase()?;
                let locked = ProtectionBits::from_status(self.nor.model.sr1, self.nor.model.sr2).any();
                let enabled = self.nor.write_enabled();
                self.nor.clear_wel();
                if locked || !enabled {
                    return Err(Status::Error);
                }
                let capacity = self.nor.model.capacity;
                self.nor.array.erase(0, capacity);
                Ok(Answer::Empty)
            }
            Operation::NorReadStatus1 => Ok(Answer::Inline(vec![self.nor.model.sr1])),
            Operation::NorReadStatus2 => Ok(Answer::Inline(vec![self.nor.model.sr2])),
            Operation::NorWriteStatus1 { value } => {
                if !self.nor.write_enabled() {
                    return Err(Status::Error);
                }
                self.nor.model.sr1 = value & !(ProtectionBits::SR1_BUSY | ProtectionBits::SR1_WEL);
                Ok(Answer::Empty)
            }
            Operation::NorWriteStatus2 { value } => {
                if !self.nor.write_enabled() {
                    return Err(Status::Error);
                }
                self.nor.model.sr2 = value;
                self.nor.clear_wel();
                Ok(Answer::Empty)
            }

            Operation::UfsInit => Ok(Answer::Empty),
            Operation::UfsReadDescriptor { idn: UFS_DESC_DEVICE, .. } => {
                Ok(Answer::Data(self.ufs_descriptor.to_bytes()))
            }
            Operation::UfsReadDescriptor { idn: UFS_DESC_UNIT, index } => self
                .unit(index)
                .map(|u| Answer::Data(encode_unit_descriptor(&u.lun)))
                .ok_or(Status::Error),
            Operation::UfsReadDescriptor { .. } => Err(Status::Error),
            Operation::UfsRead { lun, lba, blocks } => {
                let unit = self.unit(lun).filter(|u| u.lun.enabled).ok_or(Status::Error)?;
                let bs = unit.lun.block_size as u64;
                let (offset, len) = (lba as u64 * bs, blocks as u64 * bs);
                if !unit.array.contains(offset, len) {
                    return Err(Status::Error);
                }
                Ok(Answer::Data(unit.array.read(offset, len as usize)))
            }
            Operation::UfsSelectLun { lun } => {
                self.unit(lun).filter(|u| u.lun.enabled).ok_or(Status::Error)?;
                self.selected_lun = lun;
                Ok(Answer::Empty)
            }

            Operation::NandProgramPages(_)
            | Operation::SpiNandProgramPages(_)
            | Operation::EmmcWriteBlocks { .. }
            | Operation::NorPageProgram { .. }
            | Operation::UfsWrite { .. } => Err(Status::Error),
        }
    }

    fn execute_write(&mut self, op: &Operation, data: &[u8]) -> Result<(), Status> {
        if let Some(required) = interface_of(op)
            && self.interface != Some(required)
        {
            return Err(Status::Error);
        }

        let programmed = match *op {
            Operation::NandProgramPages(span) => {
                self.parallel_nand.program_span(&span, data)?;
                span_range(&span)
            }
            Operation::SpiNandProgramPages(span) => {
                self.spi_nand.program_span(&span, data)?;
                span_range(&span)
            }
            Operation::EmmcWriteBlocks { lba, count } => {
                let (offset, len) = sectors(lba, count);
                if data.len() as u64 != len || !self.emmc_array.contains(offset, len) {
                    return Err(Status::Error);
                }
                self.emmc_array.program(offset, data);
                (offset, len)
            }
            Operation::NorPageProgram { address, len } => {
                let (offset, len) = (address as u64, len as u64);
                if data.len() as u64 != len || offset % NOR_PAGE + len > NOR_PAGE {
                    self.nor.clear_wel();
                    return Err(Status::Error);
                }
                self.nor.modify(offset, len)?;
                self.nor.array.program(offset, data);
                (offset, len)
            }
            Operation::UfsWrite { lun, lba, blocks } => {
                let unit = self.unit_mut(lun).filter(|u| u.lun.enabled).ok_or(Status::Error)?;
                let bs = unit.lun.block_size as u64;
                let (offset, len) = (lba as u64 * bs, blocks as u64 * bs);
                if unit.lun.write_protected || data.len() as u64 != len || !unit.array.contains(offset, len) {
                    return Err(Status::Error);
                }
                unit.array.program(offset, data);
                if lun != UfsLunType::UserData.lun_id() {
                    return Ok(());
                }
                (offset, len)
            }
            _ => return Err(Status::Error),
        };

        let (start, len) = programmed;
        let weak: Vec<u64> = self
            .faults
            .weak_bits
            .iter()
            .copied()
            .filter(|o| (start..start + len).contains(o))
            .collect();
        if let Some(interface) = interface_of(op) {
            for offset in weak {
                self.flip_bit(interface, offset, 0);
            }
        }
        Ok(())
    }

    fn check_erase(&self) -> Result<(), Status> {
        if self.faults.fail_erase { Err(Status::Error) } else { Ok(()) }
    }

    fn nor_erase(&mut self, address: u64, unit: u64) -> Result<Answer, Status> {
        if self.faults.fail_erase {
            self.nor.clear_wel();
            return Err(Status::Error);
        }
        let start = address / unit * unit;
        self.nor.modify(start, unit)?;
        self.nor.array.erase(start, unit);
        Ok(Answer::Empty)
    }

    /// Array and raw offset for a data-area address on `interface`.
    fn locate(&mut self, interface: FlashInterface, offset: u64) -> (&mut FlashArray, u64) {
        match interface {
            FlashInterface::ParallelNand => {
                let raw = self.parallel_nand.data_offset(offset);
                (&mut self.parallel_nand.array, raw)
            }
            FlashInterface::SpiNand => {
                let raw = self.spi_nand.data_offset(offset);
                (&mut self.spi_nand.array, raw)
            }
            FlashInterface::SpiNor => (&mut self.nor.array, offset),
            FlashInterface::Emmc => (&mut self.emmc_array, offset),
            FlashInterface::Ufs => {
                let idx = self
                    .ufs_units
                    .iter()
                    .position(|u| u.lun.lun_type == UfsLunType::UserData)
                    .unwrap_or(0);
                (&mut self.ufs_units[idx].array, offset)
            }
        }
    }

    fn page_size(&self, interface: FlashInterface) -> u64 {
        match interface {
            FlashInterface::ParallelNand => self.parallel_nand.model.page_size as u64,
            FlashInterface::SpiNand => self.spi_nand.model.page_size as u64,
            _ => u64::MAX,
        }
    }

    fn flip_bit(&mut self, interface: FlashInterface, offset: u64, bit: u8) {
        let (array, raw) = self.locate(interface, offset);
        array.flip_bit(raw, bit);
    }

    /// Seed or read data-area bytes, splitting at NAND page boundaries.
    fn for_each_page_run(&self, interface: FlashInterface, offset: u64, len: usize, mut f: impl FnMut(u64, usize, usize)) {
        let page_size = self.page_size(interface);
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let room = page_size.saturating_sub(pos % page_size.max(1));
            let n = (room.min((len - done) as u64)) as usize;
            f(pos, done, n);
            done += n;
        }
    }
}

fn sectors(lba: u32, count: u32) -> (u64, u64) {
    (lba as u64 * SECTOR_BYTES as u64, count as u64 * SECTOR_BYTES as u64)
}

fn span_range(span: &PageSpan) -> (u64, u64) {
    let page_size = span.page_size as u64;
    (span.page as u64 * page_size, span.count as u64 * page_size)
}

fn interface_of(op: &Operation) -> Option<FlashInterface> {
    match op.command().subsystem() {
        Subsystem::ParallelNand => Some(FlashInterface::ParallelNand),
        Subsystem::SpiNand => Some(FlashInterface::SpiNand),
        Subsystem::SpiNor => Some(FlashInterface::SpiNor),
        Subsystem::Emmc => Some(FlashInterface::Emmc),
        Subsystem::Ufs => Some(FlashInterface::Ufs),
        _ => None,
    }
}

fn is_write(op: &Operation) -> bool {
    matches!(
        op,
        Operation::NandProgramPages(_)
            | Operation::SpiNandProgramPages(_)
            | Operation::EmmcWriteBlocks { .. }
            | Operation::NorPageProgram { .. }
            | Operation::UfsWrite { .. }
    )
}

fn is_read(op: &Operation) -> bool {
    matches!(
        op,
        Operation::NandReadPages(_)
            | Operation::SpiNandReadPages(_)
            | Operation::EmmcReadBlocks { .. }
            | Operation::NorRead { .. }
            | Operation::UfsRead { .. }
    )
}

/// Emulated programmer with every chip type attached.
///
/// Clones share state, so tests can inspect the device after moving a clone
/// into a session.
#[derive(Clone)]
pub struct EmulatedDevice {
    inner: Arc<Mutex<DeviceModel>>,
}

impl EmulatedDevice {
    pub fn new(config: EmulatorConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeviceModel::new(config))),
        }
    }

    fn model(&self) -> MutexGuard<'_, DeviceModel> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        self.model().faults = faults;
    }

    /// Write data-area bytes directly, bypassing program semantics.
    pub fn load(&self, interface: FlashInterface, offset: u64, data: &[u8]) {
        let mut model = self.model();
        let mut runs = Vec::new();
        model.for_each_page_run(interface, offset, data.len(), |pos, done, n| runs.push((pos, done, n)));
        for (pos, done, n) in runs {
            let (array, raw) = model.locate(interface, pos);
            array.load(raw, &data[done..done + n]);
        }
    }

    /// Write spare bytes of one NAND page.
    pub fn load_spare(&self, interface: FlashInterface, page: u64, spare: &[u8]) {
        let mut model = self.model();
        let chip = match interface {
            FlashInterface::SpiNand => &mut model.spi_nand,
            _ => &mut model.parallel_nand,
        };
        let raw = chip.raw_offset(page) + chip.model.page_size as u64;
        chip.array.load(raw, spare);
    }

    pub fn load_lun(&self, lun: UfsLunType, offset: u64, data: &[u8]) {
        if let Some(unit) = self.model().unit_mut(lun.lun_id()) {
            unit.array.load(offset, data);
        }
    }

    /// Data-area bytes as currently stored.
    pub fn contents(&self, interface: FlashInterface, offset: u64, len: usize) -> Vec<u8> {
        let mut model = self.model();
        let mut runs = Vec::new();
        model.for_each_page_run(interface, offset, len, |pos, _, n| runs.push((pos, n)));
        let mut out = Vec::with_capacity(len);
        for (pos, n) in runs {
            let (array, raw) = model.locate(interface, pos);
            out.extend_from_slice(&array.read(raw, n));
        }
        out
    }

    pub fn lun_contents(&self, lun: UfsLunType, offset: u64, len: usize) -> Vec<u8> {
        self.model()
            .unit(lun.lun_id())
            .map(|u| u.array.read(offset, len))
            .unwrap_or_default()
    }

    pub fn flip_bit(&self, interface: FlashInterface, offset: u64, bit: u8) {
        self.model().flip_bit(interface, offset, bit);
    }

    /// NOR status registers `(SR1, SR2)`.
    pub fn status_registers(&self) -> (u8, u8) {
        let model = self.model();
        (model.nor.model.sr1, model.nor.model.sr2)
    }

    pub fn block_lock(&self) -> u8 {
        self.model().spi_nand.lock & SPI_NAND_LOCK_BITS
    }

    pub fn selected_lun(&self) -> u8 {
        self.model().selected_lun
    }

    pub fn interface(&self) -> Option<FlashInterface> {
        self.model().interface
    }

    /// Every decoded command, in arrival order.
    pub fn command_log(&self) -> Vec<Operation> {
        self.model().log.clone()
    }

    pub fn clear_log(&self) {
        self.model().log.clear();
    }

    pub fn disconnect(&self) {
        let mut model = self.model();
        model.connected = false;
        model.outbox.clear();
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}

impl Transport for EmulatedDevice {
    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let mut model = self.model();
        if !model.connected {
            return Err(TransportError::Disconnected);
        }
        model.on_frame(frame);
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Frame, TransportError> {
        let mut model = self.model();
        if !model.connected {
            return Err(TransportError::Disconnected);
        }
        match model.outbox.pop_front() {
            Some(Outgoing::Frame(frame)) => Ok(frame),
            Some(Outgoing::Data(_)) => Err(TransportError::ReadFailed("expected a frame, got a data phase".into())),
            None => Err(TransportError::timeout(timeout)),
        }
    }

    fn send_bulk(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut model = self.model();
        if !model.connected {
            return Err(TransportError::Disconnected);
        }
        model.on_data(data)
    }

    fn receive_bulk(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut model = self.model();
        if !model.connected {
            return Err(TransportError::Disconnected);
        }
        match model.outbox.pop_front() {
            Some(Outgoing::Data(data)) if data.len() == len => Ok(data),
            Some(Outgoing::Data(data)) => Err(TransportError::ReadFailed(format!(
                "data phase of {} bytes, expected {}",
                data.len(),
                len
            ))),
            Some(Outgoing::Frame(_)) => Err(TransportError::ReadFailed("expected a data phase, got a frame".into())),
            None => Err(TransportError::timeout(timeout)),
        }
    }

    fn close(&self) {
        self.disconnect();
    }

    fn is_connected(&self) -> bool {
        self.model().connected
    }

    fn endpoint(&self) -> Option<Endpoint> {
        None
    }
}

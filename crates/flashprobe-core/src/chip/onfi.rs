//! ONFI parameter page parsing.

use byteorder::{ByteOrder, LittleEndian};

use super::error::ChipError;
use super::types::{CellType, ChipInfo, ChipSource, FlashInterface};
use crate::protocol::constants::ONFI_PARAM_PAGE_SIZE;

pub const ONFI_SIGNATURE: &[u8; 4] = b"ONFI";

const CRC_POLY: u16 = 0x8005;
const CRC_INIT: u16 = 0x4F4E;

/// CRC-16 over the parameter page, as defined by ONFI (MSB first, no reflection).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC_INIT;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Decoded fields of an ONFI parameter page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnfiParams {
    pub manufacturer: String,
    pub model: String,
    pub jedec_manufacturer: u8,
    pub page_size: u32,
    pub spare_size: u16,
    pub pages_per_block: u32,
    pub blocks_per_lun: u32,
    pub luns: u8,
    pub bits_per_cell: u8,
    pub ecc_bits: u8,
}

impl OnfiParams {
    pub fn parse(page: &[u8]) -> Result<Self, ChipError> {
        if page.len() < ONFI_PARAM_PAGE_SIZE {
            return Err(ChipError::InvalidParamPage(format!(
                "{} bytes, expected {}",
                page.len(),
                ONFI_PARAM_PAGE_SIZE
            )));
        }
        if &page[0..4] != ONFI_SIGNATURE {
            return Err(ChipError::InvalidParamPage("missing ONFI signature".into()));
        }
        let stored = LittleEndian::read_u16(&page[254..256]);
        let computed = crc16(&page[..254]);
        if stored != computed {
            return Err(ChipError::InvalidParamPage(format!(
                "CRC mismatch: stored 0x{:04X}, computed 0x{:04X}",
                stored, computed
            )));
        }

        let text = |range: std::ops::Range<usize>| {
            String::from_utf8_lossy(&page[range]).trim().to_string()
        };
        Ok(Self {
            manufacturer: text(32..44),
            model: text(44..64),
            jedec_manufacturer: page[64],
            page_size: LittleEndian::read_u32(&page[80..84]),
            spare_size: LittleEndian::read_u16(&page[84..86]),
            pages_per_block: LittleEndian::read_u32(&page[92..96]),
            blocks_per_lun: LittleEndian::read_u32(&page[96..100]),
            luns: page[100],
            bits_per_cell: page[102],
            ecc_bits: page[112],
        })
    }

    /// Serialize into a valid 256-byte parameter page.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut page = vec![0u8; ONFI_PARAM_PAGE_SIZE];
        page[0..4].copy_from_slice(ONFI_SIGNATURE);
        let pad = |dst: &mut [u8], s: &str| {
            dst.fill(b' ');
            let n = s.len().min(dst.len());
            dst[..n].copy_from_slice(&s.as_bytes()[..n]);
        };
        pad(&mut page[32..44], &self.manufacturer);
        pad(&mut page[44..64], &self.model);
        page[64] = self.jedec_manufacturer;
        LittleEndian::write_u32(&mut page[80..84], self.page_size);
        LittleEndian::write_u16(&mut page[84..86], self.spare_size);
        LittleEndian::write_u32(&mut page[92..96], self.pages_per_block);
        LittleEndian::write_u32(&mut page[96..100], self.blocks_per_lun);
        page[100] = self.luns;
        page[102] = self.bits_per_cell;
        page[112] = self.ecc_bits;
        let crc = crc16(&page[..254]);
        LittleEndian::write_u16(&mut page[254..256], crc);
        page
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.page_size as u64
            * self.pages_per_block as u64
            * self.blocks_per_lun as u64
            * self.luns.max(1) as u64
    }

    pub fn to_chip_info(&self, raw_id: &[u8]) -> ChipInfo {
        let mut info = ChipInfo::new(
            FlashInterface::ParallelNand,
            self.manufacturer.clone(),
            self.model.clone(),
            raw_id.to_vec(),
            (self.capacity_bytes() / (1024 * 1024)) as u32,
            self.page_size,
            self.pages_per_block,
        );
        info.source = ChipSource::Onfi;
        info.oob_size = self.spare_size as u32;
        info.ecc_bits = (self.ecc_bits != 0xFF).then_some(self.ecc_bits);
        info.cell_type = Some(match self.bits_per_cell {
            0 | 1 => CellType::Slc,
            2 => CellType::Mlc,
            3 => CellType::Tlc,
            _ => CellType::Qlc,
        });
        info
    }
}

//! eMMC CID and EXT_CSD decoding.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::error::ChipError;
use crate::protocol::constants::{EXT_CSD_SIZE, SECTOR_BYTES};

pub const CID_SIZE: usize = 16;

const EXT_CSD_REV: usize = 192;
const EXT_CSD_SEC_COUNT: usize = 212;
const EXT_CSD_BOOT_SIZE_MULT: usize = 226;

/// Fields of the 128-bit Card Identification register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cid {
    pub manufacturer_id: u8,
    pub oem_id: u8,
    pub product_name: String,
    pub revision: u8,
    pub serial: u32,
}

impl Cid {
    pub fn parse(raw: &[u8]) -> Result<Self, ChipError> {
        if raw.len() < CID_SIZE {
            return Err(ChipError::InvalidDescriptor {
                kind: "CID",
                reason: format!("{} bytes, expected {}", raw.len(), CID_SIZE),
            });
        }
        let product_name = raw[3..9]
            .iter()
            .filter(|b| b.is_ascii_graphic() || **b == b' ')
            .map(|&b| b as char)
            .collect::<String>()
            .trim()
            .to_string();
        Ok(Self {
            manufacturer_id: raw[0],
            oem_id: raw[2],
            product_name,
            revision: raw[9],
            serial: BigEndian::read_u32(&raw[10..14]),
        })
    }

    pub fn to_bytes(&self) -> [u8; CID_SIZE] {
        let mut raw = [0u8; CID_SIZE];
        raw[0] = self.manufacturer_id;
        raw[1] = 0x01;
        raw[2] = self.oem_id;
        let name = self.product_name.as_bytes();
        for (i, slot) in raw[3..9].iter_mut().enumerate() {
            *slot = name.get(i).copied().unwrap_or(b' ');
        }
        raw[9] = self.revision;
        BigEndian::write_u32(&mut raw[10..14], self.serial);
        raw
    }
}

/// Capacity-related fields of EXT_CSD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtCsd {
    pub revision: u8,
    pub sector_count: u32,
    pub boot_size_mult: u8,
}

impl ExtCsd {
    pub fn parse(raw: &[u8]) -> Result<Self, ChipError> {
        if raw.len() < EXT_CSD_SIZE {
            return Err(ChipError::InvalidDescriptor {
                kind: "EXT_CSD",
                reason: format!("{} bytes, expected {}", raw.len(), EXT_CSD_SIZE),
            });
        }
        Ok(Self {
            revision: raw[EXT_CSD_REV],
            sector_count: LittleEndian::read_u32(&raw[EXT_CSD_SEC_COUNT..EXT_CSD_SEC_COUNT + 4]),
            boot_size_mult: raw[EXT_CSD_BOOT_SIZE_MULT],
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = vec![0u8; EXT_CSD_SIZE];
        raw[EXT_CSD_REV] = self.revision;
        LittleEndian::write_u32(
            &mut raw[EXT_CSD_SEC_COUNT..EXT_CSD_SEC_COUNT + 4],
            self.sector_count,
        );
        raw[EXT_CSD_BOOT_SIZE_MULT] = self.boot_size_mult;
        raw
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.sector_count as u64 * SECTOR_BYTES as u64
    }

    /// Size of each boot partition.
    pub fn boot_partition_bytes(&self) -> u64 {
        self.boot_size_mult as u64 * 128 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_parse() {
        let cid = Cid {
            manufacturer_id: 0x15,
            oem_id: 0x01,
            product_name: "8GTF4R".into(),
            revision: 0x10,
            serial: 0xDEADBEEF,
        };
        let parsed = Cid::parse(&cid.to_bytes()).unwrap();
        assert_eq!(parsed, cid);
        assert!(Cid::parse(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_ext_csd_capacity() {
        let ext = ExtCsd {
            revision: 8,
            sector_count: 15_269_888,
            boot_size_mult: 32,
        };
        let parsed = ExtCsd::parse(&ext.to_bytes()).unwrap();
        assert_eq!(parsed.capacity_bytes(), 15_269_888 * 512);
        assert_eq!(parsed.boot_partition_bytes(), 4 * 1024 * 1024);
    }
}

//! UFS device and unit descriptor decoding (big-endian, JEDEC layout).

use byteorder::{BigEndian, ByteOrder};

use super::error::ChipError;
use super::types::{UfsLun, UfsLunType};
use crate::protocol::constants::{UFS_DESC_DEVICE, UFS_DESC_UNIT};

pub const DEVICE_DESCRIPTOR_SIZE: usize = 0x40;
pub const UNIT_DESCRIPTOR_SIZE: usize = 0x2D;

const DEV_SPEC_VERSION: usize = 0x10;
const DEV_MANUFACTURER_ID: usize = 0x18;

const UNIT_INDEX: usize = 0x02;
const UNIT_LU_ENABLE: usize = 0x03;
const UNIT_WRITE_PROTECT: usize = 0x05;
const UNIT_BLOCK_SIZE: usize = 0x0A;
const UNIT_BLOCK_COUNT: usize = 0x0B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub manufacturer_id: u16,
    /// BCD, e.g. 0x0310 for UFS 3.1.
    pub spec_version: u16,
}

impl DeviceDescriptor {
    pub fn parse(raw: &[u8]) -> Result<Self, ChipError> {
        check(raw, DEVICE_DESCRIPTOR_SIZE, UFS_DESC_DEVICE, "UFS device")?;
        Ok(Self {
            manufacturer_id: BigEndian::read_u16(&raw[DEV_MANUFACTURER_ID..]),
            spec_version: BigEndian::read_u16(&raw[DEV_SPEC_VERSION..]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = vec![0u8; DEVICE_DESCRIPTOR_SIZE];
        raw[0] = DEVICE_DESCRIPTOR_SIZE as u8;
        raw[1] = UFS_DESC_DEVICE;
        BigEndian::write_u16(&mut raw[DEV_SPEC_VERSION..], self.spec_version);
        BigEndian::write_u16(&mut raw[DEV_MANUFACTURER_ID..], self.manufacturer_id);
        raw
    }

    pub fn version_string(&self) -> String {
        let major = (self.spec_version >> 8) & 0xFF;
        let minor = (self.spec_version >> 4) & 0x0F;
        format!("{}.{}", major, minor)
    }
}

/// Decode a unit descriptor into a LUN description.
pub fn parse_unit_descriptor(lun_type: UfsLunType, raw: &[u8]) -> Result<UfsLun, ChipError> {
    check(raw, UNIT_DESCRIPTOR_SIZE, UFS_DESC_UNIT, "UFS unit")?;
    if raw[UNIT_INDEX] != lun_type.lun_id() {
        return Err(ChipError::InvalidDescriptor {
            kind: "UFS unit",
            reason: format!(
                "descriptor is for LUN 0x{:02X}, expected 0x{:02X}",
                raw[UNIT_INDEX],
                lun_type.lun_id()
            ),
        });
    }
    let shift = raw[UNIT_BLOCK_SIZE];
    if shift > 20 {
        return Err(ChipError::InvalidDescriptor {
            kind: "UFS unit",
            reason: format!("block size 2^{} out of range", shift),
        });
    }
    let block_size = 1u32 << shift;
    let blocks = BigEndian::read_u64(&raw[UNIT_BLOCK_COUNT..]);
    Ok(UfsLun {
        lun_type,
        capacity_bytes: blocks.saturating_mul(block_size as u64),
        block_size,
        enabled: raw[UNIT_LU_ENABLE] == 0x01,
        write_protected: raw[UNIT_WRITE_PROTECT] != 0,
    })
}

pub fn encode_unit_descriptor(lun: &UfsLun) -> Vec<u8> {
    let mut raw = vec![0u8; UNIT_DESCRIPTOR_SIZE];
    raw[0] = UNIT_DESCRIPTOR_SIZE as u8;
    raw[1] = UFS_DESC_UNIT;
    raw[UNIT_INDEX] = lun.lun_type.lun_id();
    raw[UNIT_LU_ENABLE] = lun.enabled as u8;
    raw[UNIT_WRITE_PROTECT] = lun.write_protected as u8;
    raw[UNIT_BLOCK_SIZE] = lun.block_size.trailing_zeros() as u8;
    let blocks = if lun.block_size == 0 {
        0
    } else {
        lun.capacity_bytes / lun.block_size as u64
    };
    BigEndian::write_u64(&mut raw[UNIT_BLOCK_COUNT..], blocks);
    raw
}

fn check(raw: &[u8], size: usize, idn: u8, kind: &'static str) -> Result<(), ChipError> {
    if raw.len() < size {
        return Err(ChipError::InvalidDescriptor {
            kind,
            reason: format!("{} bytes, expected {}", raw.len(), size),
        });
    }
    if raw[1] != idn {
        return Err(ChipError::InvalidDescriptor {
            kind,
            reason: format!("IDN 0x{:02X}, expected 0x{:02X}", raw[1], idn),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_descriptor() {
        let desc = DeviceDescriptor {
            manufacturer_id: 0x01CE,
            spec_version: 0x0310,
        };
        let parsed = DeviceDescriptor::parse(&desc.to_bytes()).unwrap();
        assert_eq!(parsed, desc);
        assert_eq!(parsed.version_string(), "3.1");
    }

    #[test]
    fn test_unit_descriptor() {
        let lun = UfsLun {
            lun_type: UfsLunType::BootA,
            capacity_bytes: 4 * 1024 * 1024,
            block_size: 4096,
            enabled: true,
            write_protected: true,
        };
        let raw = encode_unit_descriptor(&lun);
        assert_eq!(parse_unit_descriptor(UfsLunType::BootA, &raw).unwrap(), lun);
        assert!(parse_unit_descriptor(UfsLunType::BootB, &raw).is_err());
    }

    #[test]
    fn test_wrong_idn_rejected() {
        let raw = DeviceDescriptor {
            manufacturer_id: 1,
            spec_version: 0x0220,
        }
        .to_bytes();
        assert!(parse_unit_descriptor(UfsLunType::UserData, &raw).is_err());
    }
}

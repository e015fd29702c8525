//! Chip description types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Bus interface used to talk to the flash chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlashInterface {
    ParallelNand,
    SpiNand,
    SpiNor,
    Emmc,
    Ufs,
}

impl FlashInterface {
    pub const ALL: [FlashInterface; 5] = [
        FlashInterface::ParallelNand,
        FlashInterface::SpiNand,
        FlashInterface::SpiNor,
        FlashInterface::Emmc,
        FlashInterface::Ufs,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            FlashInterface::ParallelNand => 0,
            FlashInterface::SpiNand => 1,
            FlashInterface::SpiNor => 2,
            FlashInterface::Emmc => 3,
            FlashInterface::Ufs => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|i| i.as_u8() == value)
    }

    /// NAND interfaces carry a spare area per page.
    pub fn is_nand(self) -> bool {
        matches!(self, FlashInterface::ParallelNand | FlashInterface::SpiNand)
    }

    /// Managed devices address 512-byte logical blocks.
    pub fn is_managed(self) -> bool {
        matches!(self, FlashInterface::Emmc | FlashInterface::Ufs)
    }
}

impl fmt::Display for FlashInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashInterface::ParallelNand => write!(f, "Parallel NAND"),
            FlashInterface::SpiNand => write!(f, "SPI NAND"),
            FlashInterface::SpiNor => write!(f, "SPI NOR"),
            FlashInterface::Emmc => write!(f, "eMMC"),
            FlashInterface::Ufs => write!(f, "UFS"),
        }
    }
}

impl FromStr for FlashInterface {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pnand" | "parallel-nand" | "nand" => Ok(FlashInterface::ParallelNand),
            "spinand" | "spi-nand" => Ok(FlashInterface::SpiNand),
            "spinor" | "spi-nor" | "nor" => Ok(FlashInterface::SpiNor),
            "emmc" => Ok(FlashInterface::Emmc),
            "ufs" => Ok(FlashInterface::Ufs),
            other => Err(format!("unknown interface '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellType {
    Slc,
    Mlc,
    Tlc,
    Qlc,
}

/// How a [`ChipInfo`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChipSource {
    /// Exact or prefix match in the chip database.
    Database,
    /// Decoded from the device code without a database entry.
    Heuristic,
    /// Read from the ONFI parameter page.
    Onfi,
    /// Nothing matched; conservative defaults.
    Defaults,
}

/// SPI NOR write-protect region encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionBits {
    pub bp0: bool,
    pub bp1: bool,
    pub bp2: bool,
    pub tb: bool,
    pub sec: bool,
    pub cmp: bool,
}

impl ProtectionBits {
    pub const SR1_BUSY: u8 = 0x01;
    pub const SR1_WEL: u8 = 0x02;
    pub const SR1_BP0: u8 = 0x04;
    pub const SR1_BP1: u8 = 0x08;
    pub const SR1_BP2: u8 = 0x10;
    pub const SR1_TB: u8 = 0x20;
    pub const SR1_SEC: u8 = 0x40;
    pub const SR1_SRP0: u8 = 0x80;
    pub const SR2_QE: u8 = 0x02;
    pub const SR2_CMP: u8 = 0x40;

    /// Mask of every SR1 bit that takes part in the protection encoding.
    pub const SR1_PROTECTION_MASK: u8 =
        Self::SR1_BP0 | Self::SR1_BP1 | Self::SR1_BP2 | Self::SR1_TB | Self::SR1_SEC;

    pub fn from_status(sr1: u8, sr2: u8) -> Self {
        Self {
            bp0: sr1 & Self::SR1_BP0 != 0,
            bp1: sr1 & Self::SR1_BP1 != 0,
            bp2: sr1 & Self::SR1_BP2 != 0,
            tb: sr1 & Self::SR1_TB != 0,
            sec: sr1 & Self::SR1_SEC != 0,
            cmp: sr2 & Self::SR2_CMP != 0,
        }
    }

    /// SPI NAND block-lock register (feature 0xA0): BP2..BP0 at bits 5..3,
    /// INV at bit 2, CMP at bit 1.
    pub fn from_spi_nand_lock(reg: u8) -> Self {
        Self {
            bp0: reg & 0x08 != 0,
            bp1: reg & 0x10 != 0,
            bp2: reg & 0x20 != 0,
            tb: reg & 0x04 != 0,
            sec: false,
            cmp: reg & 0x02 != 0,
        }
    }

    /// Whether any part of the array is write protected.
    ///
    /// CMP only inverts the protected range, so with all BP bits clear it
    /// protects the whole chip.
    pub fn any(&self) -> bool {
        let bp = self.bp0 || self.bp1 || self.bp2;
        bp != self.cmp
    }

    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for ProtectionBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |on: bool, name: &'static str| if on { name } else { "-" };
        write!(
            f,
            "{} {} {} {} {} {}",
            flag(self.bp0, "BP0"),
            flag(self.bp1, "BP1"),
            flag(self.bp2, "BP2"),
            flag(self.tb, "TB"),
            flag(self.sec, "SEC"),
            flag(self.cmp, "CMP")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UfsLunType {
    UserData,
    BootA,
    BootB,
    Rpmb,
}

impl UfsLunType {
    pub fn lun_id(self) -> u8 {
        match self {
            UfsLunType::UserData => 0x00,
            UfsLunType::BootA => 0x01,
            UfsLunType::BootB => 0x02,
            UfsLunType::Rpmb => 0xC4,
        }
    }

    pub fn from_lun_id(id: u8) -> Option<Self> {
        match id {
            0x00 => Some(UfsLunType::UserData),
            0x01 => Some(UfsLunType::BootA),
            0x02 => Some(UfsLunType::BootB),
            0xC4 => Some(UfsLunType::Rpmb),
            _ => None,
        }
    }
}

impl fmt::Display for UfsLunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UfsLunType::UserData => write!(f, "User Data"),
            UfsLunType::BootA => write!(f, "Boot A"),
            UfsLunType::BootB => write!(f, "Boot B"),
            UfsLunType::Rpmb => write!(f, "RPMB"),
        }
    }
}

impl FromStr for UfsLunType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" | "userdata" | "user-data" => Ok(UfsLunType::UserData),
            "boota" | "boot-a" => Ok(UfsLunType::BootA),
            "bootb" | "boot-b" => Ok(UfsLunType::BootB),
            "rpmb" => Ok(UfsLunType::Rpmb),
            other => Err(format!("unknown LUN '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UfsLun {
    pub lun_type: UfsLunType,
    pub capacity_bytes: u64,
    pub block_size: u32,
    pub enabled: bool,
    pub write_protected: bool,
}

/// Identification result for one chip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipInfo {
    pub manufacturer: String,
    pub model: String,
    pub chip_id: Vec<u8>,
    /// Capacity in MiB. Zero only together with `resolved == false`.
    pub size_mb: u32,
    pub page_size: u32,
    /// Spare bytes per page; zero for NOR and managed flash.
    pub oob_size: u32,
    /// Pages per erase block.
    pub block_size: u32,
    pub interface: FlashInterface,
    pub resolved: bool,
    pub source: ChipSource,
    pub cell_type: Option<CellType>,
    pub sector_size: Option<u32>,
    pub jedec_id: Option<u32>,
    pub supports_qspi: Option<bool>,
    pub supports_dual: Option<bool>,
    pub voltage: Option<String>,
    pub max_clock_mhz: Option<u32>,
    pub protection: Option<ProtectionBits>,
    pub luns: Vec<UfsLun>,
    pub ufs_version: Option<String>,
    /// Correctable bits per 512 bytes the vendor requires.
    pub ecc_bits: Option<u8>,
}

impl ChipInfo {
    pub const UNKNOWN: &'static str = "Unknown";
    /// Smallest page size any supported interface uses.
    pub const DEFAULT_PAGE_SIZE: u32 = 512;
    /// Smallest block size small-page NAND uses.
    pub const DEFAULT_PAGES_PER_BLOCK: u32 = 32;

    /// Skeleton for a chip with known geometry; optional fields left empty.
    pub fn new(
        interface: FlashInterface,
        manufacturer: impl Into<String>,
        model: impl Into<String>,
        chip_id: Vec<u8>,
        size_mb: u32,
        page_size: u32,
        block_size: u32,
    ) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            model: model.into(),
            chip_id,
            size_mb,
            page_size,
            oob_size: 0,
            block_size,
            interface,
            resolved: true,
            source: ChipSource::Database,
            cell_type: None,
            sector_size: None,
            jedec_id: None,
            supports_qspi: None,
            supports_dual: None,
            voltage: None,
            max_clock_mhz: None,
            protection: None,
            luns: Vec::new(),
            ufs_version: None,
            ecc_bits: None,
        }
    }

    /// Sentinel for an unidentified chip: conservative geometry, no capabilities.
    pub fn unknown(interface: FlashInterface, raw_id: &[u8]) -> Self {
        let page_size = match interface {
            FlashInterface::SpiNor => 256,
            _ => Self::DEFAULT_PAGE_SIZE,
        };
        let mut info = Self::new(
            interface,
            Self::UNKNOWN,
            Self::UNKNOWN,
            raw_id.to_vec(),
            0,
            page_size,
            Self::DEFAULT_PAGES_PER_BLOCK,
        );
        info.resolved = false;
        info.source = ChipSource::Defaults;
        if interface.is_nand() {
            info.oob_size = page_size / 32;
        }
        info
    }

    pub fn capacity_known(&self) -> bool {
        self.size_mb > 0
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.size_mb as u64 * 1024 * 1024
    }

    /// Erase block size in bytes.
    pub fn block_bytes(&self) -> u64 {
        self.page_size as u64 * self.block_size as u64
    }

    pub fn total_pages(&self) -> Option<u64> {
        (self.capacity_known() && self.page_size > 0)
            .then(|| self.capacity_bytes() / self.page_size as u64)
    }

    pub fn total_blocks(&self) -> Option<u64> {
        let block = self.block_bytes();
        (self.capacity_known() && block > 0).then(|| self.capacity_bytes() / block)
    }

    /// Capacity must be a whole number of erase blocks when both are known.
    pub fn geometry_consistent(&self) -> bool {
        let block = self.block_bytes();
        !self.capacity_known() || block == 0 || self.capacity_bytes() % block == 0
    }

    pub fn lun(&self, lun_type: UfsLunType) -> Option<&UfsLun> {
        self.luns.iter().find(|l| l.lun_type == lun_type)
    }

    pub fn id_hex(&self) -> String {
        self.chip_id
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Feature flags reported by the programmer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub parallel_nand: bool,
    pub spi_nand: bool,
    pub spi_nor: bool,
    pub emmc: bool,
    pub ufs: bool,
    pub nv_ddr: bool,
    pub hardware_ecc: bool,
    pub wifi: bool,
    pub bluetooth: bool,
    pub high_speed_usb: bool,
    pub sd_card: bool,
    pub logic_analyzer: bool,
    pub soft_ecc: bool,
}

impl DeviceCapabilities {
    pub fn from_bitmap(bits: u32) -> Self {
        let has = |mask: u32| bits & mask != 0;
        Self {
            parallel_nand: has(0x0001),
            spi_nand: has(0x0002),
            spi_nor: has(0x0004),
            emmc: has(0x0008),
            nv_ddr: has(0x0010),
            hardware_ecc: has(0x0020),
            wifi: has(0x0040),
            bluetooth: has(0x0080),
            high_speed_usb: has(0x0100),
            ufs: has(0x0200),
            sd_card: has(0x0400),
            logic_analyzer: has(0x0800),
            soft_ecc: has(0x1000),
        }
    }

    pub fn to_bitmap(&self) -> u32 {
        [
            (self.parallel_nand, 0x0001),
            (self.spi_nand, 0x0002),
            (self.spi_nor, 0x0004),
            (self.emmc, 0x0008),
            (self.nv_ddr, 0x0010),
            (self.hardware_ecc, 0x0020),
            (self.wifi, 0x0040),
            (self.bluetooth, 0x0080),
            (self.high_speed_usb, 0x0100),
            (self.ufs, 0x0200),
            (self.sd_card, 0x0400),
            (self.logic_analyzer, 0x0800),
            (self.soft_ecc, 0x1000),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .fold(0, |acc, (_, mask)| acc | mask)
    }

    pub fn supports(&self, interface: FlashInterface) -> bool {
        match interface {
            FlashInterface::ParallelNand => self.parallel_nand,
            FlashInterface::SpiNand => self.spi_nand,
            FlashInterface::SpiNor => self.spi_nor,
            FlashInterface::Emmc => self.emmc,
            FlashInterface::Ufs => self.ufs,
        }
    }

    /// Preferred interface when the caller did not choose one.
    pub fn default_interface(&self) -> Option<FlashInterface> {
        FlashInterface::ALL.iter().copied().find(|i| self.supports(*i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_codes() {
        for i in FlashInterface::ALL {
            assert_eq!(FlashInterface::from_u8(i.as_u8()), Some(i));
        }
        assert_eq!(FlashInterface::from_u8(9), None);
        assert_eq!("spi-nor".parse::<FlashInterface>(), Ok(FlashInterface::SpiNor));
    }

    #[test]
    fn test_protection_from_status_registers() {
        let bits = ProtectionBits::from_status(0x1C, 0x40);
        assert!(bits.bp0 && bits.bp1 && bits.bp2 && bits.cmp);
        assert!(!bits.tb && !bits.sec);
        // CMP inverts a full BP range into "nothing protected".
        assert!(!bits.any());

        let clear = ProtectionBits::from_status(ProtectionBits::SR1_WEL, ProtectionBits::SR2_QE);
        assert!(clear.is_clear());
        assert!(!clear.any());
        assert!(ProtectionBits::from_status(0x04, 0x00).any());
        assert!(ProtectionBits::from_status(0x00, 0x40).any());
    }

    #[test]
    fn test_spi_nand_lock_register() {
        let locked = ProtectionBits::from_spi_nand_lock(0x38);
        assert!(locked.bp0 && locked.bp1 && locked.bp2);
        assert!(ProtectionBits::from_spi_nand_lock(0x00).is_clear());
    }

    #[test]
    fn test_unknown_chip_is_flagged() {
        let info = ChipInfo::unknown(FlashInterface::ParallelNand, &[0x12, 0x34]);
        assert!(!info.resolved);
        assert_eq!(info.manufacturer, ChipInfo::UNKNOWN);
        assert_eq!(info.page_size, 512);
        assert_eq!(info.block_size, 32);
        assert_eq!(info.oob_size, 16);
        assert!(!info.capacity_known());
        assert_eq!(info.total_pages(), None);
        assert!(info.geometry_consistent());
    }

    #[test]
    fn test_geometry_consistency() {
        let ok = ChipInfo::new(FlashInterface::ParallelNand, "Samsung", "K9F1G08U0B", vec![], 128, 2048, 64);
        assert!(ok.geometry_consistent());
        assert_eq!(ok.total_pages(), Some(65536));
        assert_eq!(ok.total_blocks(), Some(1024));

        let bad = ChipInfo::new(FlashInterface::ParallelNand, "X", "Y", vec![], 1, 3000, 7);
        assert!(!bad.geometry_consistent());
    }

    #[test]
    fn test_capability_bitmap() {
        let caps = DeviceCapabilities::from_bitmap(0x0001 | 0x0004 | 0x0200 | 0x1000);
        assert!(caps.parallel_nand && caps.spi_nor && caps.ufs && caps.soft_ecc);
        assert!(!caps.emmc && !caps.wifi);
        assert_eq!(caps.to_bitmap(), 0x1205);
        assert!(caps.supports(FlashInterface::Ufs));
        assert_eq!(caps.default_interface(), Some(FlashInterface::ParallelNand));
        assert_eq!(DeviceCapabilities::default().default_interface(), None);
    }

    #[test]
    fn test_lun_ids() {
        assert_eq!(UfsLunType::Rpmb.lun_id(), 0xC4);
        assert_eq!(UfsLunType::from_lun_id(0x02), Some(UfsLunType::BootB));
        assert_eq!(UfsLunType::from_lun_id(0x05), None);
    }
}

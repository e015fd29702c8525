//! Static chip database.
//!
//! Loaded once, then shared read-only between sessions through an `Arc`.
//! Alternate tables can be loaded from TOML for testing or for parts the
//! built-in list does not know.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::types::{CellType, ChipInfo, ChipSource, FlashInterface};

/// One database row, matched by ID prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipEntry {
    pub interface: FlashInterface,
    /// ID bytes matched as a prefix of the raw ID.
    pub id: Vec<u8>,
    pub manufacturer: String,
    pub model: String,
    pub size_mb: u32,
    pub page_size: u32,
    #[serde(default)]
    pub oob_size: u32,
    /// Pages per erase block.
    pub block_size: u32,
    #[serde(default)]
    pub cell_type: Option<CellType>,
    #[serde(default)]
    pub sector_size: Option<u32>,
    #[serde(default)]
    pub supports_qspi: Option<bool>,
    #[serde(default)]
    pub supports_dual: Option<bool>,
    #[serde(default)]
    pub voltage: Option<String>,
    #[serde(default)]
    pub max_clock_mhz: Option<u32>,
    #[serde(default)]
    pub ecc_bits: Option<u8>,
}

impl ChipEntry {
    fn base(
        interface: FlashInterface,
        id: &[u8],
        manufacturer: &str,
        model: &str,
        size_mb: u32,
        page_size: u32,
        block_size: u32,
    ) -> Self {
        Self {
            interface,
            id: id.to_vec(),
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            size_mb,
            page_size,
            oob_size: 0,
            block_size,
            cell_type: None,
            sector_size: None,
            supports_qspi: None,
            supports_dual: None,
            voltage: None,
            max_clock_mhz: None,
            ecc_bits: None,
        }
    }

    fn nand(
        interface: FlashInterface,
        id: &[u8],
        manufacturer: &str,
        model: &str,
        size_mb: u32,
        page_size: u32,
        oob_size: u32,
        ecc_bits: u8,
    ) -> Self {
        let mut entry = Self::base(interface, id, manufacturer, model, size_mb, page_size, 64);
        entry.oob_size = oob_size;
        entry.cell_type = Some(CellType::Slc);
        entry.ecc_bits = Some(ecc_bits);
        entry.voltage = Some("3.3V".into());
        entry
    }

    fn nor(id: &[u8], manufacturer: &str, model: &str, size_mb: u32, clock: u32, voltage: &str) -> Self {
        let mut entry = Self::base(FlashInterface::SpiNor, id, manufacturer, model, size_mb, 256, 256);
        entry.sector_size = Some(4096);
        entry.supports_qspi = Some(true);
        entry.supports_dual = Some(true);
        entry.max_clock_mhz = Some(clock);
        entry.voltage = Some(voltage.into());
        entry
    }

    /// Materialize a [`ChipInfo`] for the given raw ID.
    pub fn to_info(&self, raw_id: &[u8]) -> ChipInfo {
        let mut info = ChipInfo::new(
            self.interface,
            self.manufacturer.clone(),
            self.model.clone(),
            raw_id.to_vec(),
            self.size_mb,
            self.page_size,
            self.block_size,
        );
        info.source = ChipSource::Database;
        info.oob_size = self.oob_size;
        info.cell_type = self.cell_type;
        info.sector_size = self.sector_size;
        info.supports_qspi = self.supports_qspi;
        info.supports_dual = self.supports_dual;
        info.voltage = self.voltage.clone();
        info.max_clock_mhz = self.max_clock_mhz;
        info.ecc_bits = self.ecc_bits;
        if self.interface == FlashInterface::SpiNor && raw_id.len() >= 3 {
            info.jedec_id =
                Some(((raw_id[0] as u32) << 16) | ((raw_id[1] as u32) << 8) | raw_id[2] as u32);
        }
        info
    }

    fn matches(&self, interface: FlashInterface, raw_id: &[u8]) -> bool {
        self.interface == interface && !self.id.is_empty() && raw_id.starts_with(&self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChipDatabase {
    #[serde(default, rename = "chip")]
    entries: Vec<ChipEntry>,
}

impl ChipDatabase {
    pub fn new(entries: Vec<ChipEntry>) -> Self {
        Self { entries }
    }

    /// Parts known out of the box.
    pub fn builtin() -> Self {
        use FlashInterface::{ParallelNand, SpiNand};
        let mut entries = vec![
            ChipEntry::nand(ParallelNand, &[0xEC, 0xF1, 0x00, 0x95, 0x40], "Samsung", "K9F1G08U0B", 128, 2048, 64, 1),
            ChipEntry::nand(ParallelNand, &[0xEC, 0xDA, 0x10, 0x95, 0x44], "Samsung", "K9F2G08U0C", 256, 2048, 64, 1),
            ChipEntry::nand(ParallelNand, &[0xEC, 0xDC, 0x10, 0x95, 0x54], "Samsung", "K9F4G08U0D", 512, 2048, 64, 1),
            ChipEntry::nand(ParallelNand, &[0xAD, 0xF1, 0x80, 0x1D], "Hynix", "H27U1G8F2B", 128, 2048, 64, 1),
            ChipEntry::nand(ParallelNand, &[0x98, 0xF1, 0x80, 0x15], "Toshiba", "TC58NVG0S3E", 128, 2048, 64, 1),
            ChipEntry::nand(ParallelNand, &[0x2C, 0xF1, 0x80, 0x95], "Micron", "MT29F1G08ABADA", 128, 2048, 64, 4),
            ChipEntry::nand(SpiNand, &[0xC8, 0xD1], "GigaDevice", "GD5F1GQ4UB", 128, 2048, 128, 8),
            ChipEntry::nand(SpiNand, &[0xC8, 0xD2], "GigaDevice", "GD5F2GQ4UB", 256, 2048, 128, 8),
            ChipEntry::nand(SpiNand, &[0xEF, 0xAA, 0x21], "Winbond", "W25N01GV", 128, 2048, 64, 1),
            ChipEntry::nand(SpiNand, &[0xC2, 0x12], "Macronix", "MX35LF1GE4AB", 128, 2048, 64, 4),
            ChipEntry::nand(SpiNand, &[0x2C, 0x14], "Micron", "MT29F1G01ABAFD", 128, 2048, 128, 8),
            ChipEntry::nor(&[0xEF, 0x40, 0x14], "Winbond", "W25Q80DV", 1, 104, "3.3V"),
            ChipEntry::nor(&[0xEF, 0x40, 0x15], "Winbond", "W25Q16JV", 2, 133, "3.3V"),
            ChipEntry::nor(&[0xEF, 0x40, 0x16], "Winbond", "W25Q32JV", 4, 133, "3.3V"),
            ChipEntry::nor(&[0xEF, 0x40, 0x17], "Winbond", "W25Q64JV", 8, 133, "3.3V"),
            ChipEntry::nor(&[0xEF, 0x40, 0x18], "Winbond", "W25Q128JV", 16, 133, "3.3V"),
            ChipEntry::nor(&[0xEF, 0x60, 0x18], "Winbond", "W25Q128FW", 16, 104, "1.8V"),
            ChipEntry::nor(&[0xC2, 0x20, 0x18], "Macronix", "MX25L12835F", 16, 133, "3.3V"),
            ChipEntry::nor(&[0xC8, 0x40, 0x17], "GigaDevice", "GD25Q64C", 8, 120, "3.3V"),
            ChipEntry::nor(&[0x20, 0xBA, 0x18], "Micron", "N25Q128A", 16, 108, "3.3V"),
        ];
        // Large-page MLC part: 4 KiB pages, 128 pages per block.
        let mut k9f8 = ChipEntry::nand(ParallelNand, &[0xEC, 0xD3, 0x51, 0x95, 0x58], "Samsung", "K9F8G08U0M", 1024, 4096, 128, 4);
        k9f8.cell_type = Some(CellType::Mlc);
        k9f8.block_size = 128;
        entries.push(k9f8);
        Self { entries }
    }

    pub fn builtin_shared() -> Arc<Self> {
        Arc::new(Self::builtin())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load a TOML table of `[[chip]]` entries.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Built-in table extended with entries from a TOML file.
    pub fn builtin_with_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut db = Self::builtin();
        db.entries.extend(Self::load_from_file(path)?.entries);
        Ok(db)
    }

    pub fn entries(&self) -> &[ChipEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Longest matching prefix wins. Equal-length matches are ordered by
    /// manufacturer code, then device code, then table order.
    pub fn lookup(&self, interface: FlashInterface, raw_id: &[u8]) -> Option<&ChipEntry> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.matches(interface, raw_id))
            .min_by_key(|(idx, e)| {
                (
                    std::cmp::Reverse(e.id.len()),
                    e.id.first().copied(),
                    e.id.get(1).copied(),
                    *idx,
                )
            })
            .map(|(_, e)| e)
    }
}

/// JEDEC manufacturer codes shared by raw NAND and serial flash.
pub fn manufacturer_name(code: u8) -> Option<&'static str> {
    match code {
        0xEC => Some("Samsung"),
        0x98 => Some("Toshiba"),
        0xAD => Some("Hynix"),
        0x2C => Some("Micron"),
        0x89 => Some("Intel"),
        0x01 => Some("Spansion"),
        0xC2 => Some("Macronix"),
        0xEF => Some("Winbond"),
        0xC8 => Some("GigaDevice"),
        0x92 => Some("ESMT"),
        0x20 => Some("Micron"),
        0x9D => Some("ISSI"),
        0x1F => Some("Atmel"),
        _ => None,
    }
}

/// eMMC CID manufacturer IDs.
pub fn emmc_manufacturer_name(mid: u8) -> Option<&'static str> {
    match mid {
        0x15 => Some("Samsung"),
        0x45 => Some("SanDisk"),
        0x13 | 0xFE => Some("Micron"),
        0x11 => Some("Toshiba"),
        0x90 => Some("Hynix"),
        0x70 => Some("Kingston"),
        _ => None,
    }
}

/// UFS wManufacturerID values.
pub fn ufs_manufacturer_name(id: u16) -> Option<&'static str> {
    match id {
        0x01CE => Some("Samsung"),
        0x01AD => Some("SK Hynix"),
        0x0198 => Some("Kioxia"),
        0x012C => Some("Micron"),
        0x0145 => Some("Western Digital"),
        _ => None,
    }
}

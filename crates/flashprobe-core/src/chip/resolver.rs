//! Identification: raw ID bytes to [`ChipInfo`].
//!
//! Lookup order is database prefix match, then interface-specific heuristics,
//! then conservative defaults. Anything short of a database (or ONFI /
//! self-describing) hit comes back as [`Resolution::Unresolved`] so the caller
//! can try further queries before accepting the fallback.

use tracing::debug;

use super::database::{ChipDatabase, emmc_manufacturer_name, manufacturer_name, ufs_manufacturer_name};
use super::emmc::{Cid, ExtCsd};
use super::error::ChipError;
use super::types::{CellType, ChipInfo, ChipSource, FlashInterface, UfsLun, UfsLunType};
use super::ufs::DeviceDescriptor;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ChipInfo),
    Unresolved { raw_id: Vec<u8>, fallback: ChipInfo },
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }

    /// The resolved chip, or the fallback description.
    pub fn into_info(self) -> ChipInfo {
        match self {
            Resolution::Resolved(info) => info,
            Resolution::Unresolved { fallback, .. } => fallback,
        }
    }

    pub fn info(&self) -> &ChipInfo {
        match self {
            Resolution::Resolved(info) => info,
            Resolution::Unresolved { fallback, .. } => fallback,
        }
    }
}

/// Identify a chip from its raw ID bytes.
pub fn identify(db: &ChipDatabase, interface: FlashInterface, raw_id: &[u8]) -> Resolution {
    if let Some(entry) = db.lookup(interface, raw_id) {
        debug!(model = %entry.model, "Chip database hit");
        return Resolution::Resolved(entry.to_info(raw_id));
    }

    let fallback = heuristic(interface, raw_id).unwrap_or_else(|| ChipInfo::unknown(interface, raw_id));
    debug!(
        interface = %interface,
        source = ?fallback.source,
        "Chip not in database"
    );
    Resolution::Unresolved {
        raw_id: raw_id.to_vec(),
        fallback,
    }
}

/// Device-code decoding for parts without a database entry.
fn heuristic(interface: FlashInterface, raw_id: &[u8]) -> Option<ChipInfo> {
    let info = match interface {
        FlashInterface::ParallelNand => nand_heuristic(raw_id)?,
        FlashInterface::SpiNor => nor_heuristic(raw_id)?,
        FlashInterface::SpiNand | FlashInterface::Emmc | FlashInterface::Ufs => return None,
    };
    Some(info)
}

fn manufacturer_or_unknown(code: Option<&u8>) -> String {
    code.and_then(|c| manufacturer_name(*c))
        .unwrap_or(ChipInfo::UNKNOWN)
        .to_string()
}

/// Size class by NAND device code: (MiB, page size, pages per block, MLC).
fn nand_device_class(code: u8) -> Option<(u32, u32, u32, bool)> {
    let class = match code {
        0x73 => (16, 512, 32, false),
        0x75 => (32, 512, 32, false),
        0x76 => (64, 512, 32, false),
        0xF1 | 0xA1 => (128, 2048, 64, false),
        0xDA | 0xCA => (256, 2048, 64, false),
        0xDC | 0xCC => (512, 2048, 64, false),
        0xD3 | 0xB3 => (1024, 4096, 64, false),
        0xD5 | 0xC5 => (2048, 4096, 128, true),
        0xD7 | 0xB7 => (4096, 4096, 128, true),
        0xDE | 0xBE => (8192, 8192, 256, true),
        _ => return None,
    };
    Some(class)
}

fn nand_heuristic(raw_id: &[u8]) -> Option<ChipInfo> {
    let (size_mb, page_size, ppb, mlc) = nand_device_class(*raw_id.get(1)?)?;
    let manufacturer = manufacturer_or_unknown(raw_id.first());
    let mut info = ChipInfo::new(
        FlashInterface::ParallelNand,
        manufacturer,
        format!("NAND {}MB", size_mb),
        raw_id.to_vec(),
        size_mb,
        page_size,
        ppb,
    );
    info.resolved = false;
    info.source = ChipSource::Heuristic;
    info.oob_size = page_size / 32;
    info.cell_type = Some(if mlc { CellType::Mlc } else { CellType::Slc });
    Some(info)
}

fn nor_heuristic(raw_id: &[u8]) -> Option<ChipInfo> {
    let capacity_code = *raw_id.get(2)?;
    let bytes: u64 = match capacity_code {
        0x14..=0x1A => 1 << capacity_code,
        // Micron encodes 512 Mbit and up from 0x20.
        0x20..=0x22 => (64 * 1024 * 1024) << (capacity_code - 0x20),
        _ => return None,
    };
    let size_mb = (bytes / (1024 * 1024)) as u32;
    let mut info = ChipInfo::new(
        FlashInterface::SpiNor,
        manufacturer_or_unknown(raw_id.first()),
        format!("SPI NOR {}MB", size_mb),
        raw_id.to_vec(),
        size_mb,
        256,
        256,
    );
    info.resolved = false;
    info.source = ChipSource::Heuristic;
    info.sector_size = Some(4096);
    info.jedec_id = Some(((raw_id[0] as u32) << 16) | ((raw_id[1] as u32) << 8) | capacity_code as u32);
    Some(info)
}

/// Pages per erase unit reported for managed flash (512 KiB units).
const MANAGED_ERASE_UNIT: u64 = 512 * 1024;

/// eMMC describes itself through CID and EXT_CSD.
pub fn resolve_emmc(db: &ChipDatabase, cid_raw: &[u8], ext_csd_raw: &[u8]) -> Result<Resolution, ChipError> {
    if let Some(entry) = db.lookup(FlashInterface::Emmc, cid_raw) {
        return Ok(Resolution::Resolved(entry.to_info(cid_raw)));
    }
    let cid = Cid::parse(cid_raw)?;
    let ext = ExtCsd::parse(ext_csd_raw)?;

    let page_size = 512;
    let mut info = ChipInfo::new(
        FlashInterface::Emmc,
        emmc_manufacturer_name(cid.manufacturer_id).unwrap_or(ChipInfo::UNKNOWN),
        if cid.product_name.is_empty() {
            ChipInfo::UNKNOWN.to_string()
        } else {
            cid.product_name.clone()
        },
        cid_raw.to_vec(),
        (ext.capacity_bytes() / (1024 * 1024)) as u32,
        page_size,
        (MANAGED_ERASE_UNIT / page_size as u64) as u32,
    );
    info.voltage = Some("1.8V/3.3V".into());

    if emmc_manufacturer_name(cid.manufacturer_id).is_some() && info.capacity_known() {
        Ok(Resolution::Resolved(info))
    } else {
        info.resolved = false;
        info.source = ChipSource::Heuristic;
        Ok(Resolution::Unresolved {
            raw_id: cid_raw.to_vec(),
            fallback: info,
        })
    }
}

/// UFS describes itself through the device descriptor and per-LUN unit descriptors.
pub fn resolve_ufs(db: &ChipDatabase, device_raw: &[u8], luns: Vec<UfsLun>) -> Result<Resolution, ChipError> {
    let desc = DeviceDescriptor::parse(device_raw)?;
    let raw_id = desc.manufacturer_id.to_be_bytes().to_vec();
    let user = luns
        .iter()
        .find(|l| l.lun_type == UfsLunType::UserData && l.enabled)
        .cloned();

    let mut info = match db.lookup(FlashInterface::Ufs, &raw_id) {
        Some(entry) => entry.to_info(&raw_id),
        None => {
            let page_size = user.as_ref().map(|l| l.block_size).unwrap_or(4096);
            ChipInfo::new(
                FlashInterface::Ufs,
                ufs_manufacturer_name(desc.manufacturer_id).unwrap_or(ChipInfo::UNKNOWN),
                format!("UFS {}", desc.version_string()),
                raw_id.clone(),
                user.as_ref()
                    .map(|l| (l.capacity_bytes / (1024 * 1024)) as u32)
                    .unwrap_or(0),
                page_size,
                (MANAGED_ERASE_UNIT / page_size.max(1) as u64) as u32,
            )
        }
    };
    info.ufs_version = Some(desc.version_string());
    info.luns = luns;

    let known = ufs_manufacturer_name(desc.manufacturer_id).is_some() || info.source == ChipSource::Database;
    if known && info.capacity_known() {
        Ok(Resolution::Resolved(info))
    } else {
        info.resolved = false;
        info.source = ChipSource::Heuristic;
        Ok(Resolution::Unresolved { raw_id, fallback: info })
    }
}

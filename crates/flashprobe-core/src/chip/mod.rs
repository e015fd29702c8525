//! Chip identification and description.

pub mod database;
pub mod emmc;
pub mod error;
pub mod onfi;
pub mod protection;
pub mod resolver;
pub mod types;
pub mod ufs;

pub use database::{ChipDatabase, ChipEntry};
pub use error::ChipError;
pub use onfi::OnfiParams;
pub use resolver::{Resolution, identify, resolve_emmc, resolve_ufs};
pub use types::{
    CellType, ChipInfo, ChipSource, DeviceCapabilities, FlashInterface, ProtectionBits, UfsLun,
    UfsLunType,
};

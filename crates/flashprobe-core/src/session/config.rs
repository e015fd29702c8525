use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::chip::FlashInterface;
use crate::ecc::{EccScheme, SpareLayout};
use crate::protocol::constants::{DEFAULT_CHUNK_PAGES, DEFAULT_ERASE_TIMEOUT_MS, DEFAULT_TIMEOUT_MS};
use crate::transport::Endpoint;

/// ECC applied to NAND dumps and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EccConfig {
    pub scheme: EccScheme,
    /// First parity byte in the spare area.
    pub ecc_offset: usize,
    /// Spare bytes per page; taken from the chip when unset.
    pub oob_size: Option<u32>,
}

impl Default for EccConfig {
    fn default() -> Self {
        Self {
            scheme: EccScheme::None,
            ecc_offset: 2,
            oob_size: None,
        }
    }
}

impl EccConfig {
    pub fn layout(&self, chip_oob: u32) -> SpareLayout {
        SpareLayout {
            spare_size: self.oob_size.unwrap_or(chip_oob) as usize,
            ecc_offset: self.ecc_offset,
        }
    }
}

/// Configuration for a flash session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pages requested per read chunk.
    pub chunk_pages: u32,
    /// Extra attempts for a failed read chunk.
    pub max_retries: u32,
    /// Pause before retrying a chunk.
    pub retry_delay_ms: u64,
    /// Receive timeout for ordinary replies.
    pub timeout_ms: u64,
    /// Receive timeout for erase commands.
    pub erase_timeout_ms: u64,
    /// Interface to select on connect; first supported one when unset.
    pub interface: Option<FlashInterface>,
    pub ecc: EccConfig,
    /// Extra chip database merged over the built-in table.
    pub chip_db_path: Option<PathBuf>,
    /// Network programmers listed alongside USB devices when scanning.
    pub endpoints: Vec<Endpoint>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_pages: DEFAULT_CHUNK_PAGES,
            max_retries: 3,
            retry_delay_ms: 50,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            erase_timeout_ms: DEFAULT_ERASE_TIMEOUT_MS,
            interface: None,
            ecc: EccConfig::default(),
            chip_db_path: None,
            endpoints: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn erase_timeout(&self) -> Duration {
        Duration::from_millis(self.erase_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Chunk size as carried by a page span.
    pub fn chunk_pages(&self) -> u32 {
        self.chunk_pages.clamp(1, u16::MAX as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.chunk_pages, 64);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.ecc.scheme, EccScheme::None);
    }

    #[test]
    fn test_partial_toml() {
        let config: SessionConfig = toml::from_str(
            r#"
            chunk_pages = 16
            interface = "SpiNor"
            endpoints = ["tcp:10.0.0.5:5555"]

            [ecc]
            ecc_offset = 4

            [ecc.scheme]
            scheme = "bch"
            strength = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.chunk_pages, 16);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.interface, Some(FlashInterface::SpiNor));
        assert_eq!(config.ecc.scheme, EccScheme::Bch { strength: 8 });
        assert_eq!(config.ecc.layout(64).spare_size, 64);
        assert_eq!(config.ecc.layout(64).ecc_offset, 4);
        assert!(config.endpoints[0].is_network());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("flashprobe-config-{}.toml", std::process::id()));
        let config = SessionConfig {
            max_retries: 5,
            ecc: EccConfig {
                scheme: EccScheme::Hamming { codeword_size: 512 },
                ..Default::default()
            },
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_chunk_pages_clamped() {
        let config = SessionConfig {
            chunk_pages: 0,
            ..Default::default()
        };
        assert_eq!(config.chunk_pages(), 1);
    }
}

//! Error correction for NAND pages.
//!
//! A page is split into fixed-size codewords; each codeword's parity lives in
//! the spare area starting at [`SpareLayout::ecc_offset`], packed back to back.

pub mod bch;
pub mod gf;
pub mod hamming;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bch::Bch;
pub use hamming::Hamming;

/// Outcome of decoding one codeword or page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EccStatus {
    Clean,
    Corrected(u32),
    Uncorrectable,
}

impl EccStatus {
    /// Combine per-codeword results into a page result.
    pub fn merge(self, other: EccStatus) -> EccStatus {
        match (self, other) {
            (EccStatus::Uncorrectable, _) | (_, EccStatus::Uncorrectable) => EccStatus::Uncorrectable,
            (EccStatus::Corrected(a), EccStatus::Corrected(b)) => EccStatus::Corrected(a + b),
            (EccStatus::Corrected(n), EccStatus::Clean) | (EccStatus::Clean, EccStatus::Corrected(n)) => {
                EccStatus::Corrected(n)
            }
            (EccStatus::Clean, EccStatus::Clean) => EccStatus::Clean,
        }
    }

    pub fn is_uncorrectable(&self) -> bool {
        matches!(self, EccStatus::Uncorrectable)
    }

    pub fn corrected_bits(&self) -> u32 {
        match self {
            EccStatus::Corrected(n) => *n,
            _ => 0,
        }
    }
}

impl fmt::Display for EccStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EccStatus::Clean => write!(f, "clean"),
            EccStatus::Corrected(n) => write!(f, "corrected {} bit(s)", n),
            EccStatus::Uncorrectable => write!(f, "uncorrectable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum EccScheme {
    #[default]
    None,
    Hamming {
        codeword_size: usize,
    },
    Bch {
        strength: u8,
    },
}

/// Where parity sits inside the spare area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpareLayout {
    /// Bytes of spare area per page.
    pub spare_size: usize,
    /// First parity byte; bytes before it hold the bad-block marker and metadata.
    pub ecc_offset: usize,
}

impl Default for SpareLayout {
    fn default() -> Self {
        Self {
            spare_size: 64,
            ecc_offset: 2,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EccError {
    #[error("Unsupported ECC configuration: {0}")]
    Unsupported(String),

    #[error("Page size {page_size} is not a multiple of the {codeword_size}-byte codeword")]
    PageNotMultiple { page_size: usize, codeword_size: usize },

    #[error("Spare area too small: need {needed} bytes from offset {offset}, have {available}")]
    SpareTooSmall {
        needed: usize,
        offset: usize,
        available: usize,
    },
}

#[derive(Debug, Clone)]
enum Codec {
    Hamming(Hamming),
    Bch(Box<Bch>),
}

impl Codec {
    fn codeword_size(&self) -> usize {
        match self {
            Codec::Hamming(h) => h.codeword_size(),
            Codec::Bch(_) => bch::CODEWORD_SIZE,
        }
    }

    fn ecc_bytes(&self) -> usize {
        match self {
            Codec::Hamming(_) => hamming::ECC_BYTES,
            Codec::Bch(b) => b.ecc_bytes(),
        }
    }

    fn encode(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Codec::Hamming(h) => h.encode(data).to_vec(),
            Codec::Bch(b) => b.encode(data),
        }
    }

    fn decode(&self, data: &mut [u8], ecc: &[u8]) -> EccStatus {
        match self {
            Codec::Hamming(h) => h.decode(data, ecc),
            Codec::Bch(b) => b.decode(data, ecc),
        }
    }
}

/// Page-level ECC engine for one scheme and spare layout.
#[derive(Debug, Clone)]
pub struct EccEngine {
    codec: Option<Codec>,
    layout: SpareLayout,
}

impl EccEngine {
    pub fn new(scheme: EccScheme, layout: SpareLayout) -> Result<Self, EccError> {
        let codec = match scheme {
            EccScheme::None => None,
            EccScheme::Hamming { codeword_size } => Some(Codec::Hamming(
                Hamming::new(codeword_size).ok_or_else(|| {
                    EccError::Unsupported(format!("Hamming codeword of {} bytes", codeword_size))
                })?,
            )),
            EccScheme::Bch { strength } => Some(Codec::Bch(Box::new(Bch::new(strength).ok_or_else(
                || EccError::Unsupported(format!("BCH strength t={}", strength)),
            )?))),
        };
        Ok(Self { codec, layout })
    }

    pub fn is_enabled(&self) -> bool {
        self.codec.is_some()
    }

    pub fn layout(&self) -> SpareLayout {
        self.layout
    }

    /// Parity bytes one page needs.
    pub fn ecc_bytes_per_page(&self, page_size: usize) -> usize {
        match &self.codec {
            Some(c) => (page_size / c.codeword_size()) * c.ecc_bytes(),
            None => 0,
        }
    }

    /// Validate a page geometry against this engine.
    pub fn check_geometry(&self, page_size: usize) -> Result<(), EccError> {
        let Some(codec) = &self.codec else {
            return Ok(());
        };
        let cw = codec.codeword_size();
        if page_size == 0 || page_size % cw != 0 {
            return Err(EccError::PageNotMultiple {
                page_size,
                codeword_size: cw,
            });
        }
        let needed = self.ecc_bytes_per_page(page_size);
        if self.layout.ecc_offset + needed > self.layout.spare_size {
            return Err(EccError::SpareTooSmall {
                needed,
                offset: self.layout.ecc_offset,
                available: self.layout.spare_size,
            });
        }
        Ok(())
    }

    /// Write parity for `data` into `spare`.
    pub fn encode_page(&self, data: &[u8], spare: &mut [u8]) -> Result<(), EccError> {
        self.check_geometry(data.len())?;
        let Some(codec) = &self.codec else {
            return Ok(());
        };
        let ecc_len = codec.ecc_bytes();
        for (i, chunk) in data.chunks(codec.codeword_size()).enumerate() {
            let start = self.layout.ecc_offset + i * ecc_len;
            spare[start..start + ecc_len].copy_from_slice(&codec.encode(chunk));
        }
        Ok(())
    }

    /// Decode one page in place.
    ///
    /// When any codeword is uncorrectable the whole page is left exactly as
    /// read, so callers keep the raw bytes.
    pub fn decode_page(&self, data: &mut [u8], spare: &[u8]) -> Result<EccStatus, EccError> {
        self.check_geometry(data.len())?;
        let Some(codec) = &self.codec else {
            return Ok(EccStatus::Clean);
        };
        let raw = data.to_vec();
        let ecc_len = codec.ecc_bytes();
        let mut status = EccStatus::Clean;
        for (i, chunk) in data.chunks_mut(codec.codeword_size()).enumerate() {
            let start = self.layout.ecc_offset + i * ecc_len;
            status = status.merge(codec.decode(chunk, &spare[start..start + ecc_len]));
        }
        if status.is_uncorrectable() {
            data.copy_from_slice(&raw);
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_status_merge() {
        use EccStatus::*;
        assert_eq!(Clean.merge(Clean), Clean);
        assert_eq!(Clean.merge(Corrected(1)), Corrected(1));
        assert_eq!(Corrected(2).merge(Corrected(3)), Corrected(5));
        assert_eq!(Corrected(2).merge(Uncorrectable), Uncorrectable);
    }

    #[test]
    fn test_hamming_page_single_bit() {
        let engine = EccEngine::new(EccScheme::Hamming { codeword_size: 512 }, SpareLayout::default()).unwrap();
        let original = page(2048);
        let mut spare = vec![0xFF; 64];
        engine.encode_page(&original, &mut spare).unwrap();
        assert_eq!(spare[0..2], [0xFF, 0xFF]);

        let mut data = original.clone();
        data[1500] ^= 0x08;
        assert_eq!(engine.decode_page(&mut data, &spare).unwrap(), EccStatus::Corrected(1));
        assert_eq!(data, original);
    }

    #[test]
    fn test_uncorrectable_page_keeps_raw_bytes() {
        let engine = EccEngine::new(EccScheme::Hamming { codeword_size: 512 }, SpareLayout::default()).unwrap();
        let original = page(2048);
        let mut spare = vec![0xFF; 64];
        engine.encode_page(&original, &mut spare).unwrap();

        let mut data = original.clone();
        // First codeword: correctable. Third: two flips.
        data[10] ^= 0x01;
        data[1100] ^= 0x01;
        data[1101] ^= 0x01;
        let raw = data.clone();
        assert_eq!(engine.decode_page(&mut data, &spare).unwrap(), EccStatus::Uncorrectable);
        assert_eq!(data, raw);
    }

    #[test]
    fn test_bch_page() {
        let layout = SpareLayout {
            spare_size: 64,
            ecc_offset: 8,
        };
        let engine = EccEngine::new(EccScheme::Bch { strength: 4 }, layout).unwrap();
        assert_eq!(engine.ecc_bytes_per_page(2048), 28);
        let original = page(2048);
        let mut spare = vec![0xFF; 64];
        engine.encode_page(&original, &mut spare).unwrap();

        let mut data = original.clone();
        data[0] ^= 0x80;
        data[700] ^= 0x11;
        data[2047] ^= 0x01;
        assert_eq!(engine.decode_page(&mut data, &spare).unwrap(), EccStatus::Corrected(4));
        assert_eq!(data, original);
    }

    #[test]
    fn test_erased_page_is_clean() {
        let engine = EccEngine::new(EccScheme::Bch { strength: 8 }, SpareLayout {
            spare_size: 128,
            ecc_offset: 2,
        })
        .unwrap();
        let mut data = vec![0xFF; 2048];
        let spare = vec![0xFF; 128];
        assert_eq!(engine.decode_page(&mut data, &spare).unwrap(), EccStatus::Clean);
    }

    #[test]
    fn test_geometry_checks() {
        let engine = EccEngine::new(EccScheme::Bch { strength: 8 }, SpareLayout::default()).unwrap();
        assert!(matches!(
            engine.check_geometry(4096),
            Err(EccError::SpareTooSmall { needed: 104, .. })
        ));
        assert!(matches!(
            engine.check_geometry(1000),
            Err(EccError::PageNotMultiple { .. })
        ));
        assert!(EccEngine::new(EccScheme::Hamming { codeword_size: 100 }, SpareLayout::default()).is_err());
        let none = EccEngine::new(EccScheme::None, SpareLayout::default()).unwrap();
        assert!(!none.is_enabled());
        assert_eq!(none.ecc_bytes_per_page(2048), 0);
    }
}

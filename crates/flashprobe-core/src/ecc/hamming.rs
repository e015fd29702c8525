//! Single-error-correcting Hamming code over 256- or 512-byte codewords.
//!
//! For a codeword of `2^m` bits the code keeps, for every address line `k`, the
//! parity of all set bits whose index has bit `k` set (P_k) and the parity of
//! those where it is clear (P_k'). A single flipped data bit toggles exactly
//! one member of every pair, and the toggled P_k bits spell out its index.
//!
//! The 22/24 parity bits are stored inverted in 3 bytes so that an erased
//! codeword and an erased spare area agree.

use super::EccStatus;

pub const ECC_BYTES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hamming {
    codeword_size: usize,
    address_bits: u32,
}

impl Hamming {
    /// `codeword_size` must be 256 or 512.
    pub fn new(codeword_size: usize) -> Option<Self> {
        match codeword_size {
            256 | 512 => Some(Self {
                codeword_size,
                address_bits: (codeword_size * 8).trailing_zeros(),
            }),
            _ => None,
        }
    }

    pub fn codeword_size(&self) -> usize {
        self.codeword_size
    }

    fn parity_mask(&self) -> u32 {
        (1u32 << (2 * self.address_bits)) - 1
    }

    /// Raw parity pairs: bit 2k = P_k', bit 2k+1 = P_k.
    fn parity(&self, data: &[u8]) -> u32 {
        let mut index_xor: u32 = 0;
        let mut total: u32 = 0;
        for (byte_idx, &byte) in data[..self.codeword_size].iter().enumerate() {
            if byte == 0 {
                continue;
            }
            total ^= byte.count_ones() & 1;
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    index_xor ^= (byte_idx * 8 + bit) as u32;
                }
            }
        }
        let mut code = 0u32;
        for k in 0..self.address_bits {
            let p = (index_xor >> k) & 1;
            code |= (total ^ p) << (2 * k);
            code |= p << (2 * k + 1);
        }
        code
    }

    fn pack(&self, code: u32) -> [u8; ECC_BYTES] {
        let mask = self.parity_mask();
        let stored = (!code & mask) | (!mask & 0x00FF_FFFF);
        [stored as u8, (stored >> 8) as u8, (stored >> 16) as u8]
    }

    fn unpack(bytes: &[u8]) -> u32 {
        bytes[0] as u32 | ((bytes[1] as u32) << 8) | ((bytes[2] as u32) << 16)
    }

    pub fn encode(&self, data: &[u8]) -> [u8; ECC_BYTES] {
        self.pack(self.parity(data))
    }

    /// Check `data` against stored `ecc`, repairing a single-bit error in place.
    pub fn decode(&self, data: &mut [u8], ecc: &[u8]) -> EccStatus {
        let computed = Self::unpack(&self.encode(data));
        let diff = (computed ^ Self::unpack(ecc)) & self.parity_mask();
        if diff == 0 {
            return EccStatus::Clean;
        }

        let single_data_bit = (0..self.address_bits).all(|k| ((diff >> (2 * k)) & 0b11).count_ones() == 1);
        if single_data_bit {
            let index = (0..self.address_bits).fold(0usize, |acc, k| {
                acc | ((((diff >> (2 * k + 1)) & 1) as usize) << k)
            });
            data[index / 8] ^= 1 << (index % 8);
            return EccStatus::Corrected(1);
        }

        if diff.count_ones() == 1 {
            // The flipped bit is in the stored ECC itself.
            return EccStatus::Corrected(1);
        }
        EccStatus::Uncorrectable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 37 + 11) as u8 ^ (i >> 3) as u8).collect()
    }

    #[test]
    fn test_erased_codeword_has_erased_ecc() {
        let h = Hamming::new(512).unwrap();
        assert_eq!(h.encode(&[0xFF; 512]), [0xFF; 3]);
        let h256 = Hamming::new(256).unwrap();
        assert_eq!(h256.encode(&[0xFF; 256]), [0xFF; 3]);
    }

    #[test]
    fn test_every_single_bit_flip_is_corrected() {
        let h = Hamming::new(512).unwrap();
        let original = sample(512);
        let ecc = h.encode(&original);
        for bit in 0..512 * 8 {
            let mut data = original.clone();
            data[bit / 8] ^= 1 << (bit % 8);
            assert_eq!(h.decode(&mut data, &ecc), EccStatus::Corrected(1), "bit {}", bit);
            assert_eq!(data, original, "bit {}", bit);
        }
    }

    #[test]
    fn test_256_byte_codeword() {
        let h = Hamming::new(256).unwrap();
        let original = sample(256);
        let ecc = h.encode(&original);
        let mut data = original.clone();
        data[200] ^= 0x10;
        assert_eq!(h.decode(&mut data, &ecc), EccStatus::Corrected(1));
        assert_eq!(data, original);
    }

    #[test]
    fn test_double_bit_flip_is_uncorrectable_and_untouched() {
        let h = Hamming::new(512).unwrap();
        let original = sample(512);
        let ecc = h.encode(&original);
        for (a, b) in [(0usize, 1usize), (5, 4000), (1023, 1024), (17, 4095)] {
            let mut data = original.clone();
            data[a / 8] ^= 1 << (a % 8);
            data[b / 8] ^= 1 << (b % 8);
            let corrupted = data.clone();
            assert_eq!(h.decode(&mut data, &ecc), EccStatus::Uncorrectable);
            assert_eq!(data, corrupted);
        }
    }

    #[test]
    fn test_ecc_bit_flip() {
        let h = Hamming::new(512).unwrap();
        let original = sample(512);
        let mut ecc = h.encode(&original);
        ecc[1] ^= 0x04;
        let mut data = original.clone();
        assert_eq!(h.decode(&mut data, &ecc), EccStatus::Corrected(1));
        assert_eq!(data, original);
    }

    #[test]
    fn test_rejects_other_sizes() {
        assert!(Hamming::new(1024).is_none());
        assert!(Hamming::new(128).is_none());
    }
}

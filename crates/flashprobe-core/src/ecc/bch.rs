//! Binary BCH code over GF(2^13) for 512-byte codewords.
//!
//! Data bits are taken MSB first: data bit `i` is the coefficient of
//! x^(k+r-1-i), parity bit `j` the coefficient of x^(r-1-j), where k is the
//! data length in bits and r the generator degree. Stored parity is XORed with
//! a constant so that an erased codeword carries erased (0xFF) parity.

use super::EccStatus;
use super::gf::{Gf, N};

/// BCH codewords are fixed at one 512-byte sector; 1024 bytes would exceed
/// the 8191-bit code length once parity is added for useful `t`.
pub const CODEWORD_SIZE: usize = 512;
pub const MAX_STRENGTH: u8 = 32;

#[derive(Debug, Clone)]
pub struct Bch {
    gf: Gf,
    t: usize,
    /// Generator polynomial degree, i.e. parity bits.
    r: usize,
    /// Generator coefficients 0..r packed into 64-bit words, bit j = x^j.
    generator: Vec<u64>,
    words: usize,
    ecc_bytes: usize,
    erased_mask: Vec<u8>,
}

impl Bch {
    /// Build a code correcting up to `t` bit errors per codeword.
    pub fn new(t: u8) -> Option<Self> {
        if t == 0 || t > MAX_STRENGTH {
            return None;
        }
        let gf = Gf::new();
        let t = t as usize;
        let g = generator_poly(&gf, t);
        let r = g.len() - 1;
        let words = r.div_ceil(64);
        let mut generator = vec![0u64; words];
        for (j, &coef) in g.iter().enumerate().take(r) {
            if coef != 0 {
                generator[j / 64] |= 1 << (j % 64);
            }
        }
        let mut bch = Self {
            gf,
            t,
            r,
            generator,
            words,
            ecc_bytes: r.div_ceil(8),
            erased_mask: Vec::new(),
        };
        let erased = bch.parity_bytes(&[0xFF; CODEWORD_SIZE]);
        bch.erased_mask = erased.iter().map(|b| !b).collect();
        Some(bch)
    }

    pub fn strength(&self) -> usize {
        self.t
    }

    pub fn ecc_bytes(&self) -> usize {
        self.ecc_bytes
    }

    pub fn parity_bits(&self) -> usize {
        self.r
    }

    fn k(&self) -> usize {
        CODEWORD_SIZE * 8
    }

    fn reg_bit(reg: &[u64], j: usize) -> bool {
        (reg[j / 64] >> (j % 64)) & 1 != 0
    }

    /// Remainder of d(x)·x^r mod g(x), packed MSB first into bytes.
    fn parity_bytes(&self, data: &[u8]) -> Vec<u8> {
        let mut reg = vec![0u64; self.words];
        let top = self.r - 1;
        let top_mask = if self.r % 64 == 0 {
            u64::MAX
        } else {
            (1u64 << (self.r % 64)) - 1
        };
        for &byte in &data[..CODEWORD_SIZE] {
            for bit in (0..8).rev() {
                let feedback = ((byte >> bit) & 1 != 0) ^ Self::reg_bit(&reg, top);
                // reg <<= 1
                for w in (0..self.words).rev() {
                    let carry = if w > 0 { reg[w - 1] >> 63 } else { 0 };
                    reg[w] = (reg[w] << 1) | carry;
                }
                reg[self.words - 1] &= top_mask;
                if feedback {
                    for (w, g) in reg.iter_mut().zip(&self.generator) {
                        *w ^= g;
                    }
                }
            }
        }
        let mut out = vec![0u8; self.ecc_bytes];
        for j in 0..self.r {
            if Self::reg_bit(&reg, self.r - 1 - j) {
                out[j / 8] |= 0x80 >> (j % 8);
            }
        }
        out
    }

    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        self.parity_bytes(data)
            .iter()
            .zip(&self.erased_mask)
            .map(|(p, m)| p ^ m)
            .collect()
    }

    /// Check `data` against stored `ecc`, correcting up to `t` flipped bits in place.
    pub fn decode(&self, data: &mut [u8], ecc: &[u8]) -> EccStatus {
        let computed = self.encode(data);
        // Error pattern in the parity domain, as degrees of x.
        let mut error_degrees = Vec::new();
        for j in 0..self.r {
            let mask = 0x80 >> (j % 8);
            if (computed[j / 8] ^ ecc[j / 8]) & mask != 0 {
                error_degrees.push(self.r - 1 - j);
            }
        }
        if error_degrees.is_empty() {
            return EccStatus::Clean;
        }

        let syndromes: Vec<u16> = (1..=2 * self.t)
            .map(|i| {
                error_degrees
                    .iter()
                    .fold(0u16, |acc, &d| acc ^ self.gf.alpha_pow(i * d))
            })
            .collect();

        let locator = self.berlekamp_massey(&syndromes);
        let errors = locator.len() - 1;
        if errors == 0 || errors > self.t {
            return EccStatus::Uncorrectable;
        }

        let roots = self.chien_search(&locator);
        if roots.len() != errors {
            return EccStatus::Uncorrectable;
        }

        let k = self.k();
        for degree in roots {
            if degree >= self.r {
                let i = k + self.r - 1 - degree;
                data[i / 8] ^= 0x80 >> (i % 8);
            }
        }
        EccStatus::Corrected(errors as u32)
    }

    /// Error-locator polynomial Λ(x), lowest degree first, trimmed.
    fn berlekamp_massey(&self, s: &[u16]) -> Vec<u16> {
        let gf = &self.gf;
        let mut c = vec![1u16];
        let mut b = vec![1u16];
        let mut l = 0usize;
        let mut m = 1usize;
        let mut last_d = 1u16;

        for n in 0..s.len() {
            let mut d = s[n];
            for i in 1..=l.min(c.len() - 1) {
                d ^= gf.mul(c[i], s[n - i]);
            }
            if d == 0 {
                m += 1;
                continue;
            }
            let coef = gf.div(d, last_d);
            let mut next = c.clone();
            if next.len() < b.len() + m {
                next.resize(b.len() + m, 0);
            }
            for (i, &bi) in b.iter().enumerate() {
                next[i + m] ^= gf.mul(coef, bi);
            }
            if 2 * l <= n {
                b = c;
                l = n + 1 - l;
                last_d = d;
                m = 1;
            } else {
                m += 1;
            }
            c = next;
        }

        while c.len() > 1 && c[c.len() - 1] == 0 {
            c.pop();
        }
        if c.len() - 1 != l {
            // Degree disagrees with the register length: not a valid pattern.
            c.resize(self.t + 2, 0);
            c[self.t + 1] = 1;
        }
        c
    }

    /// Degrees p in the shortened code where Λ(α^-p) = 0.
    fn chien_search(&self, locator: &[u16]) -> Vec<usize> {
        let gf = &self.gf;
        let n = self.k() + self.r;
        debug_assert!(n <= N);
        let mut roots = Vec::new();
        for p in 0..n {
            let mut sum = 0u16;
            for (i, &coef) in locator.iter().enumerate() {
                if coef != 0 {
                    sum ^= gf.mul(coef, gf.alpha_inv_pow(i * p));
                }
            }
            if sum == 0 {
                roots.push(p);
                if roots.len() == locator.len() - 1 {
                    break;
                }
            }
        }
        roots
    }
}

/// Product of the minimal polynomials of α^1 .. α^2t, as GF(2) coefficients.
fn generator_poly(gf: &Gf, t: usize) -> Vec<u8> {
    let mut covered = vec![false; N];
    let mut g: Vec<u8> = vec![1];
    for i in (1..2 * t).step_by(2) {
        if covered[i] {
            continue;
        }
        // Cyclotomic coset of i.
        let mut coset = Vec::new();
        let mut e = i;
        while !covered[e] {
            covered[e] = true;
            coset.push(e);
            e = (e * 2) % N;
        }
        // Minimal polynomial ∏ (x - α^e) over the coset.
        let mut min_poly: Vec<u16> = vec![1];
        for &e in &coset {
            let root = gf.alpha_pow(e);
            let mut next = vec![0u16; min_poly.len() + 1];
            for (j, &coef) in min_poly.iter().enumerate() {
                next[j + 1] ^= coef;
                next[j] ^= gf.mul(coef, root);
            }
            min_poly = next;
        }
        // Coefficients of a minimal polynomial lie in GF(2).
        let binary: Vec<u8> = min_poly.iter().map(|&c| (c != 0) as u8).collect();
        let mut product = vec![0u8; g.len() + binary.len() - 1];
        for (a, &ga) in g.iter().enumerate() {
            if ga == 0 {
                continue;
            }
            for (b, &mb) in binary.iter().enumerate() {
                product[a + b] ^= mb;
            }
        }
        g = product;
    }
    g
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..CODEWORD_SIZE).map(|i| (i as u8).wrapping_mul(73) ^ 0x5A).collect()
    }

    fn flip(data: &mut [u8], bit: usize) {
        data[bit / 8] ^= 0x80 >> (bit % 8);
    }

    #[test]
    fn test_parity_size() {
        let bch = Bch::new(8).unwrap();
        assert_eq!(bch.parity_bits(), 104);
        assert_eq!(bch.ecc_bytes(), 13);
        assert_eq!(Bch::new(4).unwrap().ecc_bytes(), 7);
        assert!(Bch::new(0).is_none());
    }

    #[test]
    fn test_erased_codeword_is_clean() {
        let bch = Bch::new(4).unwrap();
        let ecc = bch.encode(&[0xFF; CODEWORD_SIZE]);
        assert!(ecc.iter().all(|&b| b == 0xFF));
        let mut data = vec![0xFF; CODEWORD_SIZE];
        assert_eq!(bch.decode(&mut data, &ecc), EccStatus::Clean);
    }

    #[test]
    fn test_clean_codeword() {
        let bch = Bch::new(4).unwrap();
        let mut data = sample();
        let ecc = bch.encode(&data);
        assert_eq!(bch.decode(&mut data, &ecc), EccStatus::Clean);
    }

    #[test]
    fn test_corrects_up_to_t() {
        let bch = Bch::new(8).unwrap();
        let original = sample();
        let ecc = bch.encode(&original);
        let positions = [3usize, 100, 511, 1024, 2047, 2048, 3333, 4095];
        for n in 1..=positions.len() {
            let mut data = original.clone();
            for &p in &positions[..n] {
                flip(&mut data, p);
            }
            assert_eq!(bch.decode(&mut data, &ecc), EccStatus::Corrected(n as u32), "{} errors", n);
            assert_eq!(data, original, "{} errors", n);
        }
    }

    #[test]
    fn test_errors_in_parity_are_counted() {
        let bch = Bch::new(4).unwrap();
        let original = sample();
        let mut ecc = bch.encode(&original);
        ecc[0] ^= 0x80;
        ecc[5] ^= 0x01;
        let mut data = original.clone();
        flip(&mut data, 77);
        assert_eq!(bch.decode(&mut data, &ecc), EccStatus::Corrected(3));
        assert_eq!(data, original);
    }

    #[test]
    fn test_t_plus_one_is_uncorrectable() {
        let bch = Bch::new(8).unwrap();
        let original = sample();
        let ecc = bch.encode(&original);
        let mut data = original.clone();
        for p in [1usize, 50, 400, 901, 1500, 2222, 2900, 3500, 4000] {
            flip(&mut data, p);
        }
        let corrupted = data.clone();
        assert_eq!(bch.decode(&mut data, &ecc), EccStatus::Uncorrectable);
        assert_eq!(data, corrupted);
    }

    #[test]
    fn test_erased_codeword_with_bit_flip() {
        let bch = Bch::new(4).unwrap();
        let ecc = vec![0xFF; bch.ecc_bytes()];
        let mut data = vec![0xFF; CODEWORD_SIZE];
        flip(&mut data, 1234);
        assert_eq!(bch.decode(&mut data, &ecc), EccStatus::Corrected(1));
        assert!(data.iter().all(|&b| b == 0xFF));
    }
}

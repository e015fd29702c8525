//! Arithmetic in GF(2^13).

/// Field degree.
pub const M: u32 = 13;
/// Multiplicative group order, 2^13 - 1.
pub const N: usize = (1 << M) - 1;
/// x^13 + x^4 + x^3 + x + 1.
pub const PRIMITIVE_POLY: u32 = 0x201B;

/// Log/antilog tables for GF(2^13).
#[derive(Debug, Clone)]
pub struct Gf {
    exp: Vec<u16>,
    log: Vec<u16>,
}

impl Gf {
    pub fn new() -> Self {
        let mut exp = vec![0u16; 2 * N];
        let mut log = vec![0u16; N + 1];
        let mut x: u32 = 1;
        for i in 0..N {
            exp[i] = x as u16;
            log[x as usize] = i as u16;
            x <<= 1;
            if x & (1 << M) != 0 {
                x ^= PRIMITIVE_POLY;
            }
        }
        for i in N..2 * N {
            exp[i] = exp[i - N];
        }
        Self { exp, log }
    }

    /// α^power, power taken modulo N.
    pub fn alpha_pow(&self, power: usize) -> u16 {
        self.exp[power % N]
    }

    pub fn log(&self, a: u16) -> usize {
        self.log[a as usize] as usize
    }

    pub fn mul(&self, a: u16, b: u16) -> u16 {
        if a == 0 || b == 0 {
            return 0;
        }
        self.exp[self.log(a) + self.log(b)]
    }

    /// a / b; `b` must be non-zero.
    pub fn div(&self, a: u16, b: u16) -> u16 {
        if a == 0 {
            return 0;
        }
        self.exp[self.log(a) + N - self.log(b)]
    }

    /// α^-power.
    pub fn alpha_inv_pow(&self, power: usize) -> u16 {
        self.exp[(N - power % N) % N]
    }
}

impl Default for Gf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_element_order() {
        let gf = Gf::new();
        // α generates every non-zero element exactly once.
        let mut seen = vec![false; N + 1];
        for i in 0..N {
            let v = gf.alpha_pow(i) as usize;
            assert!(v != 0 && !seen[v]);
            seen[v] = true;
        }
        assert_eq!(gf.alpha_pow(N), 1);
    }

    #[test]
    fn test_mul_div_inverse() {
        let gf = Gf::new();
        for a in [1u16, 2, 3, 0x1ABC, 0x1FFF] {
            for b in [1u16, 7, 0x0100, 0x1234] {
                let p = gf.mul(a, b);
                assert_eq!(gf.div(p, b), a);
            }
        }
        assert_eq!(gf.mul(0, 5), 0);
        assert_eq!(gf.mul(gf.alpha_pow(5), gf.alpha_inv_pow(5)), 1);
    }
}

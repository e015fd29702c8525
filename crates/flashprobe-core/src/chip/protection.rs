//! Decoding of the SPI NOR block-protect encoding into an address range.
//!
//! Follows the common Winbond/GigaDevice layout: BP2..BP0 select a power-of-two
//! fraction of the array, TB picks the bottom instead of the top, SEC switches
//! to 4 KiB sector granularity and CMP complements the result.

use std::ops::Range;

use super::types::ProtectionBits;

const SECTOR: u64 = 4096;
const MAX_SEC_REGION: u64 = 32 * 1024;

impl ProtectionBits {
    fn bp_value(&self) -> u32 {
        (self.bp0 as u32) | ((self.bp1 as u32) << 1) | ((self.bp2 as u32) << 2)
    }

    /// Byte range covered by the protection bits, or `None` when nothing is
    /// protected.
    pub fn protected_range(&self, capacity: u64) -> Option<Range<u64>> {
        let bp = self.bp_value();
        let len = match bp {
            0 => 0,
            7 => capacity,
            n if self.sec => (SECTOR << (n - 1)).min(MAX_SEC_REGION).min(capacity),
            n => capacity >> (7 - n),
        };

        let region = if len == 0 {
            0..0
        } else if len == capacity || self.tb {
            0..len
        } else {
            capacity - len..capacity
        };

        let range = if self.cmp {
            // Complement of a top range is the bottom remainder, and vice versa.
            if region.is_empty() {
                0..capacity
            } else if region.start == 0 {
                region.end..capacity
            } else {
                0..region.start
            }
        } else {
            region
        };

        (!range.is_empty()).then_some(range)
    }

    /// Fraction of the array that is write protected.
    pub fn protected_fraction(&self, capacity: u64) -> f64 {
        match (self.protected_range(capacity), capacity) {
            (_, 0) | (None, _) => 0.0,
            (Some(r), cap) => (r.end - r.start) as f64 / cap as f64,
        }
    }

    /// TB or SEC set with no BP bits is a no-op encoding, typical of a
    /// half-finished unlock or a misconfigured bootloader.
    pub fn has_orphan_modifiers(&self) -> bool {
        self.bp_value() == 0 && (self.tb || self.sec)
    }
}

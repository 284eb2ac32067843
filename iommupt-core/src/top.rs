//! Encoded top-of-table word
//!
//! The root pointer and the root level share one atomic word so lockless
//! readers always observe a consistent pair: the level lives in the low
//! three pointer bits, which table alignment guarantees to be zero.
//! Readers take an acquire load; growth publishes with a release store
//! under the host-provided top lock.

use core::sync::atomic::{AtomicU64, Ordering};

use iommupt_hal::{log2, PhysAddr};
use static_assertions::const_assert;

const LEVEL_BITS: u8 = 3;

// Every supported root level must fit the reserved pointer bits.
const_assert!((1 << LEVEL_BITS) > 6);

pub struct TopOfTable(AtomicU64);

impl TopOfTable {
    pub fn new(pa: PhysAddr, level: u8) -> Self {
        Self(AtomicU64::new(Self::pack(pa, level)))
    }

    fn pack(pa: PhysAddr, level: u8) -> u64 {
        debug_assert_eq!(log2::modulo(pa, LEVEL_BITS), 0);
        debug_assert!(level < 8);
        pa | level as u64
    }

    /// Snapshot the `(pointer, level)` pair.
    #[inline]
    pub fn load(&self) -> (PhysAddr, u8) {
        let word = self.0.load(Ordering::Acquire);
        (word & !log2::to_max(LEVEL_BITS), log2::modulo(word, LEVEL_BITS) as u8)
    }

    /// Publish a new root. Caller holds the host top lock.
    pub fn store(&self, pa: PhysAddr, level: u8) {
        self.0.store(Self::pack(pa, level), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trip() {
        let top = TopOfTable::new(0xABCD_E000, 5);
        assert_eq!(top.load(), (0xABCD_E000, 5));
        top.store(0x1_0000_0000, 2);
        assert_eq!(top.load(), (0x1_0000_0000, 2));
    }
}

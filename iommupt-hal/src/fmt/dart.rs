//! Apple DART page table format, generations 1 and 2
//!
//! 64-bit descriptors with fixed geometry: interior levels are always
//! tables, the lowest level always holds pages, so no type bit exists.
//! Leaves carry a sub-page window (start/end granule fractions in the top
//! bits) which this implementation always programs fully open. The two
//! generations differ in output address placement and protection bits.

use crate::format::{EntryKind, PtFeatures, PtFormat};
use crate::log2;
use crate::types::{PhysAddr, Prot, PtError};

const PTE_VALID: u64 = 1 << 0;

// Sub-page window, bits 63:40: start in 63:52, end in 51:40.
const SUBPAGE_START_SHIFT: u32 = 52;
const SUBPAGE_END_SHIFT: u32 = 40;
const SUBPAGE_OPEN: u64 = 0xFFF << SUBPAGE_END_SHIFT;
const SUBPAGE_MASK: u64 = (0xFFF << SUBPAGE_START_SHIFT) | (0xFFF << SUBPAGE_END_SHIFT);

// Generation 1: OA bits 35:12 in place, no-write bit 7, no-read bit 8
const V1_OA_MASK: u64 = 0x0000_000F_FFFF_F000;
const V1_PROT_NO_WRITE: u64 = 1 << 7;
const V1_PROT_NO_READ: u64 = 1 << 8;

// Generation 2: OA bits 37:10 hold the address shifted right by 4,
// no-write bit 2, no-read bit 3
const V2_OA_SHIFT: u32 = 4;
const V2_OA_MASK: u64 = 0x0000_003F_FFFF_FC00;
const V2_PROT_NO_WRITE: u64 = 1 << 2;
const V2_PROT_NO_READ: u64 = 1 << 3;

/// Pre-encoded attribute bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DartAttrs {
    bits: u64,
}

/// DART format instance
#[derive(Debug, Clone, Copy)]
pub struct Dart {
    granule_lg2: u8,
    v2: bool,
}

impl Dart {
    pub fn new(granule_lg2: u8, v2: bool) -> Result<Self, PtError> {
        if granule_lg2 != 12 && granule_lg2 != 14 {
            return Err(PtError::InvalidArgument);
        }
        if v2 && granule_lg2 < 14 {
            // Generation 2 places the OA at a 16 KiB granularity
            return Err(PtError::InvalidArgument);
        }
        Ok(Self { granule_lg2, v2 })
    }

    fn encode_pa(&self, pa: PhysAddr) -> u64 {
        if self.v2 {
            log2::div(pa, V2_OA_SHIFT as u8) & V2_OA_MASK
        } else {
            pa & V1_OA_MASK
        }
    }

    fn decode_pa(&self, word: u64) -> PhysAddr {
        if self.v2 {
            (word & V2_OA_MASK) << V2_OA_SHIFT
        } else {
            word & V1_OA_MASK
        }
    }

    fn prot_mask(&self) -> u64 {
        if self.v2 {
            V2_PROT_NO_WRITE | V2_PROT_NO_READ
        } else {
            V1_PROT_NO_WRITE | V1_PROT_NO_READ
        }
    }
}

impl PtFormat for Dart {
    type Word = u64;
    type Attrs = DartAttrs;

    fn max_top_level(&self) -> u8 {
        // FIXME: some second-generation instances refuse addresses at and
        // above 512 GiB; carried over unresolved from the reference driver.
        if self.v2 {
            3
        } else {
            2
        }
    }

    fn granule_lg2sz(&self) -> u8 {
        self.granule_lg2
    }

    fn max_va_lg2(&self) -> u8 {
        (self.granule_lg2 - 3) * self.max_top_level() + self.granule_lg2
    }

    fn max_oa_lg2(&self) -> u8 {
        if self.v2 {
            42
        } else {
            36
        }
    }

    fn supported_features(&self) -> PtFeatures {
        let mut f = PtFeatures::DMA_INCOHERENT;
        if self.v2 {
            f |= PtFeatures::DART_V2;
        }
        f
    }

    fn num_items_lg2(&self, _level: u8) -> u8 {
        self.granule_lg2 - 3
    }

    fn item_lg2sz(&self, level: u8) -> u8 {
        self.granule_lg2 + (self.granule_lg2 - 3) * (level - 1)
    }

    fn can_have_leaf(&self, level: u8) -> bool {
        level == 1
    }

    fn possible_sizes(&self, level: u8) -> u64 {
        if level == 1 {
            log2::to_int(self.granule_lg2)
        } else {
            0
        }
    }

    fn entry_kind(&self, word: u64, level: u8) -> EntryKind {
        if word & PTE_VALID == 0 {
            EntryKind::Empty
        } else if level == 1 {
            EntryKind::Oa
        } else {
            EntryKind::Table
        }
    }

    fn entry_oa(&self, word: u64, _level: u8) -> PhysAddr {
        self.decode_pa(word) & !log2::to_max(self.granule_lg2)
    }

    fn entry_num_contig_lg2(&self, _word: u64, _level: u8) -> u8 {
        0
    }

    fn table_pa(&self, word: u64, _level: u8) -> PhysAddr {
        self.decode_pa(word) & !log2::to_max(self.granule_lg2)
    }

    fn encode_leaf(&self, oa: PhysAddr, _level: u8, _oasz_lg2: u8, attrs: &DartAttrs) -> u64 {
        PTE_VALID | self.encode_pa(oa) | SUBPAGE_OPEN | attrs.bits
    }

    fn encode_table(&self, table_pa: PhysAddr, _level: u8) -> u64 {
        PTE_VALID | self.encode_pa(table_pa)
    }

    fn attrs_from_entry(&self, word: u64, _level: u8) -> DartAttrs {
        DartAttrs { bits: word & self.prot_mask() }
    }

    fn attrs_from_prot(&self, prot: Prot) -> Result<DartAttrs, PtError> {
        if !prot.contains(Prot::READ) && !prot.contains(Prot::WRITE) {
            return Err(PtError::InvalidArgument);
        }
        let mut bits = 0;
        if !prot.contains(Prot::WRITE) {
            bits |= if self.v2 { V2_PROT_NO_WRITE } else { V1_PROT_NO_WRITE };
        }
        if !prot.contains(Prot::READ) {
            bits |= if self.v2 { V2_PROT_NO_READ } else { V1_PROT_NO_READ };
        }
        Ok(DartAttrs { bits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_leaf_round_trip() {
        let f = Dart::new(12, false).unwrap();
        let attrs = f.attrs_from_prot(Prot::READ | Prot::WRITE).unwrap();
        let word = f.encode_leaf(0x8_1234_5000, 1, 12, &attrs);
        assert_eq!(f.entry_kind(word, 1), EntryKind::Oa);
        assert_eq!(f.entry_oa(word, 1), 0x8_1234_5000);
        // sub-page window fully open
        assert_eq!(word & SUBPAGE_MASK, SUBPAGE_OPEN);
        assert_eq!(f.attrs_from_entry(word, 1), attrs);
    }

    #[test]
    fn v2_shifts_oa() {
        let f = Dart::new(14, true).unwrap();
        let attrs = f.attrs_from_prot(Prot::READ).unwrap();
        let oa = 0x3F0_1234_4000;
        let word = f.encode_leaf(oa, 1, 14, &attrs);
        assert_eq!(f.entry_oa(word, 1), oa);
        assert_ne!(word & V2_PROT_NO_WRITE, 0);
    }

    #[test]
    fn interior_levels_are_tables() {
        let f = Dart::new(14, true).unwrap();
        let word = f.encode_table(0x1_0000_4000, 2);
        assert_eq!(f.entry_kind(word, 2), EntryKind::Table);
        assert_eq!(f.table_pa(word, 2), 0x1_0000_4000);
        assert_eq!(f.entry_kind(0, 2), EntryKind::Empty);
    }
}

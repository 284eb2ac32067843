//! x86 PAE page table format
//!
//! 64-bit descriptors over a 32-bit input space: a four-entry page
//! directory pointer table over two 512-entry levels. Leaves are 4 KiB
//! pages or 2 MiB PS directory entries. Directory pointer entries carry a
//! restricted encoding without RW/US.

use crate::format::{EntryKind, PtFeatures, PtFormat};
use crate::log2;
use crate::types::{PhysAddr, Prot, PtError};

const PTE_P: u64 = 1 << 0;
const PTE_RW: u64 = 1 << 1;
const PTE_US: u64 = 1 << 2;
const PTE_A: u64 = 1 << 5;
const PTE_D: u64 = 1 << 6;
const PTE_PS: u64 = 1 << 7;
const OA_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const PTE_XD: u64 = 1u64 << 63;

const GRANULE_LG2: u8 = 12;

/// Pre-encoded attribute bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86PaeAttrs {
    bits: u64,
}

/// x86 PAE format instance
#[derive(Debug, Clone, Copy, Default)]
pub struct X86Pae {
    dirty_tracking: bool,
}

impl X86Pae {
    pub fn new() -> Self {
        Self { dirty_tracking: false }
    }

    pub fn with_dirty_tracking() -> Self {
        Self { dirty_tracking: true }
    }

    fn attr_mask(&self) -> u64 {
        let mut mask = PTE_RW | PTE_US | PTE_A | PTE_XD;
        if !self.dirty_tracking {
            mask |= PTE_D;
        }
        mask
    }
}

impl PtFormat for X86Pae {
    type Word = u64;
    type Attrs = X86PaeAttrs;

    fn max_top_level(&self) -> u8 {
        3
    }

    fn granule_lg2sz(&self) -> u8 {
        GRANULE_LG2
    }

    fn max_va_lg2(&self) -> u8 {
        32
    }

    fn max_oa_lg2(&self) -> u8 {
        52
    }

    fn supported_features(&self) -> PtFeatures {
        PtFeatures::DMA_INCOHERENT
    }

    fn num_items_lg2(&self, level: u8) -> u8 {
        if level == 3 {
            2
        } else {
            9
        }
    }

    fn item_lg2sz(&self, level: u8) -> u8 {
        GRANULE_LG2 + 9 * (level - 1)
    }

    fn can_have_leaf(&self, level: u8) -> bool {
        level <= 2
    }

    fn possible_sizes(&self, level: u8) -> u64 {
        if self.can_have_leaf(level) {
            log2::to_int(self.item_lg2sz(level))
        } else {
            0
        }
    }

    fn entry_kind(&self, word: u64, level: u8) -> EntryKind {
        if word & PTE_P == 0 {
            EntryKind::Empty
        } else if level == 1 || (level == 2 && word & PTE_PS != 0) {
            EntryKind::Oa
        } else {
            EntryKind::Table
        }
    }

    fn entry_oa(&self, word: u64, level: u8) -> PhysAddr {
        (word & OA_MASK) & !log2::to_max(self.item_lg2sz(level))
    }

    fn entry_num_contig_lg2(&self, _word: u64, _level: u8) -> u8 {
        0
    }

    fn table_pa(&self, word: u64, _level: u8) -> PhysAddr {
        word & OA_MASK
    }

    fn encode_leaf(&self, oa: PhysAddr, level: u8, _oasz_lg2: u8, attrs: &X86PaeAttrs) -> u64 {
        let mut word = PTE_P | (oa & OA_MASK) | attrs.bits;
        if level == 2 {
            word |= PTE_PS;
        }
        word
    }

    fn encode_table(&self, table_pa: PhysAddr, level: u8) -> u64 {
        if level == 3 {
            // Directory pointer entries have no RW/US
            PTE_P | (table_pa & OA_MASK)
        } else {
            PTE_P | PTE_RW | PTE_US | (table_pa & OA_MASK)
        }
    }

    fn attrs_from_entry(&self, word: u64, _level: u8) -> X86PaeAttrs {
        X86PaeAttrs { bits: word & self.attr_mask() }
    }

    fn attrs_from_prot(&self, prot: Prot) -> Result<X86PaeAttrs, PtError> {
        if !prot.contains(Prot::READ) {
            // Reads cannot be disabled in this layout
            return Err(PtError::InvalidArgument);
        }
        let mut bits = PTE_A;
        if prot.contains(Prot::WRITE) {
            bits |= PTE_RW;
        }
        if !prot.contains(Prot::PRIV) {
            bits |= PTE_US;
        }
        if prot.contains(Prot::NOEXEC) {
            bits |= PTE_XD;
        }
        if !self.dirty_tracking {
            bits |= PTE_D;
        }
        Ok(X86PaeAttrs { bits })
    }

    fn dirty_tracking(&self) -> bool {
        self.dirty_tracking
    }

    fn entry_is_dirty(&self, word: u64, _level: u8) -> bool {
        word & PTE_D != 0
    }

    fn entry_clear_dirty(&self, word: u64, _level: u8) -> u64 {
        word & !PTE_D
    }

    fn entry_set_dirty(&self, word: u64, _level: u8) -> u64 {
        word | PTE_D
    }
}
